use engine::archive::single_file_archive;
use engine::{Client, Container, ExecCommand};
use log::info;

use crate::container::PG_DATA_DIR;
use crate::PostgresError;

static MODIFY_PGHBA: &[u8] = include_bytes!("../scripts/modify-pghba.sh");

const SCRIPT_NAME: &str = "modify-pghba";
const SCRIPT_DIR: &str = "/etc/postgresql";
const SCRIPT_MODE: u32 = 0o655;

/// Lets remote hosts, the backup runner included, log in with a password.
pub async fn patch_pg_hba(client: &Client, container: &Container) -> Result<(), PostgresError> {
    let archive = single_file_archive(SCRIPT_NAME, MODIFY_PGHBA, SCRIPT_MODE)
        .map_err(PostgresError::io("packing pg_hba script"))?;
    client
        .copy_to_container(container, archive, SCRIPT_DIR)
        .await
        .map_err(PostgresError::engine("copying pg_hba script into container"))?;

    let hba_file = format!("{PG_DATA_DIR}pg_hba.conf");
    let command = ExecCommand::new([format!("./{SCRIPT_NAME}"), hba_file])
        .user("postgres")
        .working_dir(SCRIPT_DIR);
    client
        .exec_checked(container, &command)
        .await
        .map_err(PostgresError::engine("updating pg_hba.conf"))?;

    info!("Updated pg_hba.conf of {}", container.name());
    Ok(())
}

/// Makes a running server re-read its configuration files.
pub async fn reload_postgres(
    client: &Client,
    container: &Container,
    maj_version: u32,
) -> Result<(), PostgresError> {
    let command = ExecCommand::new(["pg_ctl", "-D", PG_DATA_DIR, "reload"])
        .user("postgres")
        .working_dir(format!("/usr/lib/postgresql/{maj_version}/bin/"));
    client
        .exec_checked(container, &command)
        .await
        .map_err(PostgresError::engine("reloading postgres config"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::archive::read_entries;
    use engine::fake::FakeEngine;
    use engine::ContainerSpec;
    use std::sync::Arc;
    use std::time::Duration;

    async fn running_db(fake: &Arc<FakeEngine>) -> (Client, Container) {
        let client = Client::new(fake.clone(), Duration::from_secs(1), Duration::from_secs(5));
        let mut container = Container::new(ContainerSpec::new(
            "pgdock-postgres-orders",
            "amd64/postgres:16.2",
        ));
        client.start(&mut container).await.unwrap();
        (client, container)
    }

    #[tokio::test]
    async fn script_is_uploaded_then_run_as_postgres() {
        let fake = Arc::new(FakeEngine::new());
        let (client, container) = running_db(&fake).await;

        patch_pg_hba(&client, &container).await.unwrap();

        let uploads = fake.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, "/etc/postgresql");
        let entries = read_entries(&uploads[0].archive).unwrap();
        assert_eq!(entries[0].path, "modify-pghba");
        assert_eq!(entries[0].mode, 0o655);
        assert!(String::from_utf8_lossy(&entries[0].contents).contains("0.0.0.0/0 md5"));

        let execs = fake.execs();
        assert_eq!(
            execs[0].command.cmd,
            vec!["./modify-pghba", "/var/lib/postgresql/data/pg_hba.conf"]
        );
        assert_eq!(execs[0].command.user.as_deref(), Some("postgres"));
        assert_eq!(execs[0].command.working_dir.as_deref(), Some("/etc/postgresql"));
    }

    #[tokio::test]
    async fn failing_script_is_an_error() {
        let fake = Arc::new(FakeEngine::new());
        fake.set_exit_code("./modify-pghba", 1);
        let (client, container) = running_db(&fake).await;

        let err = patch_pg_hba(&client, &container).await.unwrap_err();
        assert!(err.to_string().starts_with("updating pg_hba.conf"));
    }

    #[tokio::test]
    async fn reload_runs_pg_ctl_from_version_bin_dir() {
        let fake = Arc::new(FakeEngine::new());
        let (client, container) = running_db(&fake).await;

        reload_postgres(&client, &container, 16).await.unwrap();

        let exec = &fake.execs()[0];
        assert_eq!(
            exec.command.cmd,
            vec!["pg_ctl", "-D", "/var/lib/postgresql/data/", "reload"]
        );
        assert_eq!(
            exec.command.working_dir.as_deref(),
            Some("/usr/lib/postgresql/16/bin/")
        );
    }
}
