//! Tar archives exchanged with containers.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

/// Ownership and permission overrides applied while archiving a path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// uid and gid written into every entry
    pub owner: Option<(u64, u64)>,
    pub dir_mode: Option<u32>,
    pub file_mode: Option<u32>,
}

/// A single entry read back from an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub is_dir: bool,
    pub contents: Vec<u8>,
}

/// Builds an in-memory archive holding one regular file.
pub fn single_file_archive(name: &str, contents: &[u8], mode: u32) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}

/// Archives a file, or the contents of a directory, applying `options`.
///
/// A directory is archived without its own name so that extracting the
/// archive into a destination directory lands the contents directly in it.
pub fn path_archive(src: &Path, options: &ArchiveOptions) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let metadata = fs::symlink_metadata(src)?;
    if metadata.is_dir() {
        for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(io::Error::other)?
                .to_path_buf();
            append_entry(&mut builder, entry.path(), &relative, options)?;
        }
    } else {
        let name = src.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "source path has no file name")
        })?;
        append_entry(&mut builder, src, Path::new(name), options)?;
    }

    builder.into_inner()
}

fn append_entry(
    builder: &mut Builder<Vec<u8>>,
    path: &Path,
    name: &Path,
    options: &ArchiveOptions,
) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);
    if let Some((uid, gid)) = options.owner {
        header.set_uid(uid);
        header.set_gid(gid);
    }

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        header.set_size(0);
        builder.append_link(&mut header, name, target)
    } else if file_type.is_dir() {
        if let Some(mode) = options.dir_mode {
            header.set_mode(mode);
        }
        header.set_size(0);
        builder.append_data(&mut header, name, io::empty())
    } else {
        if let Some(mode) = options.file_mode {
            header.set_mode(mode);
        }
        let file = fs::File::open(path)?;
        builder.append_data(&mut header, name, file)
    }
}

/// Extracts an archive into `dest`, creating it if needed.
pub fn unpack_archive(archive: &[u8], dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(archive);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}

/// Lists the entries of an archive with their contents.
pub fn read_entries(archive: &[u8]) -> io::Result<Vec<ArchiveEntry>> {
    let mut archive = Archive::new(archive);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header().clone();
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        entries.push(ArchiveEntry {
            path,
            mode: header.mode()?,
            uid: header.uid()?,
            gid: header.gid()?,
            is_dir: header.entry_type().is_dir(),
            contents,
        });
    }
    Ok(entries)
}
