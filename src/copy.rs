//! File transfer between the host and containers.
//!
//! Two adapters do the work: [`build_archive`] turns a host path into a tar
//! stream and [`extract_archive`] materializes a tar stream on the host.
//! Both are synchronous and run on the blocking pool, bridged to the
//! engine's async archive streams.

use crate::engine::{ArchiveReader, CopyToOptions, Engine, EngineError};
use crate::names::parse_container_path;
use std::borrow::Cow;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Buffer between the archive builder and the upload.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("no such file or directory: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("one of source or destination must be a container path")]
    BothSidesHost,

    #[error("copying between containers is not supported")]
    BothSidesContainer,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    BadTarStream(String),

    #[error("{op}: {source}")]
    Engine {
        op: String,
        #[source]
        source: EngineError,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Stream(#[from] io::Error),

    #[error("interrupted")]
    Interrupted,
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> CopyError + '_ {
    move |source| CopyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn bad_tar(e: impl std::fmt::Display) -> CopyError {
    CopyError::BadTarStream(e.to_string())
}

// -----------------------------------------------------------------------
// Argument planning
// -----------------------------------------------------------------------

/// Direction and endpoints of a `cp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    FromContainer {
        container: String,
        path: String,
        /// Host path, or `-` for stdout.
        dest: String,
    },
    ToContainer {
        /// Host path, or `-` for stdin.
        source: String,
        container: String,
        path: String,
    },
}

/// Validate a `cp` argument pair.
///
/// `default_container` fills in an empty container part (`:/path`).
pub fn plan_transfer(
    src: &str,
    dst: &str,
    default_container: Option<&str>,
) -> Result<Transfer, CopyError> {
    let src = parse_container_path(src);
    let dst = parse_container_path(dst);

    let fill = |container: String| -> Result<String, CopyError> {
        if !container.is_empty() {
            return Ok(container);
        }
        default_container.map(str::to_string).ok_or_else(|| {
            CopyError::InvalidArgument(
                "container path has no container: use NAME:PATH or pass --agent".to_string(),
            )
        })
    };

    match (src.is_container, dst.is_container) {
        (false, false) => Err(CopyError::BothSidesHost),
        (true, true) => Err(CopyError::BothSidesContainer),
        (true, false) => Ok(Transfer::FromContainer {
            container: fill(src.container)?,
            path: src.path,
            dest: dst.path,
        }),
        (false, true) => Ok(Transfer::ToContainer {
            source: src.path,
            container: fill(dst.container)?,
            path: dst.path,
        }),
    }
}

/// Flags shared by both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Follow a symlink at the source instead of copying the link.
    pub follow_link: bool,
    /// Keep host UID/GID on files copied into the container.
    pub copy_uid_gid: bool,
}

// -----------------------------------------------------------------------
// Filesystem -> tar
// -----------------------------------------------------------------------

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write a tar archive of `src` to `out`, rooted at `root_name`.
///
/// Directories are walked recursively. A symlink is stored as a link unless
/// `follow_link` is set, in which case its target's contents are stored.
/// Returns the archive size.
pub fn build_archive<W: Write>(
    src: &Path,
    root_name: &str,
    follow_link: bool,
    out: W,
) -> Result<u64, CopyError> {
    let meta = if follow_link {
        fs::metadata(src)
    } else {
        fs::symlink_metadata(src)
    };
    let meta = meta.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            CopyError::SourceMissing(src.to_path_buf())
        } else {
            io_at(src)(e)
        }
    })?;

    let mut builder = Builder::new(CountingWriter {
        inner: out,
        written: 0,
    });
    builder.follow_symlinks(follow_link);

    if meta.is_dir() {
        builder.append_dir_all(root_name, src).map_err(io_at(src))?;
    } else {
        builder
            .append_path_with_name(src, root_name)
            .map_err(io_at(src))?;
    }

    let mut counter = builder.into_inner().map_err(CopyError::Stream)?;
    counter.flush()?;
    debug!(src = %src.display(), bytes = counter.written, "archive built");
    Ok(counter.written)
}

// -----------------------------------------------------------------------
// tar -> filesystem
// -----------------------------------------------------------------------

/// Reject absolute paths and parent references.
fn entry_components(path: &Path) -> Result<Vec<Cow<'_, str>>, CopyError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(bad_tar(format!(
                    "entry {} escapes the destination",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(bad_tar(format!("entry {} is absolute", path.display())));
            }
        }
    }
    Ok(parts)
}

/// How archive paths map onto the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Destination is an existing directory: entries go inside it.
    Into,
    /// Destination is missing or a file: it replaces the archive root.
    Replace,
}

fn target_for(dest: &Path, placement: Placement, parts: &[Cow<'_, str>]) -> PathBuf {
    match placement {
        Placement::Into => parts.iter().fold(dest.to_path_buf(), |p, c| p.join(c.as_ref())),
        Placement::Replace => parts
            .iter()
            .skip(1)
            .fold(dest.to_path_buf(), |p, c| p.join(c.as_ref())),
    }
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Refuse entries that would be written through a symlink.
///
/// Every directory that already exists between `dest` and `target` must be
/// a real directory. An earlier entry could otherwise plant a link that
/// redirects later entries outside `dest`.
fn check_breakout(dest: &Path, target: &Path) -> Result<(), CopyError> {
    let relative = target
        .strip_prefix(dest)
        .map_err(|_| bad_tar(format!("entry {} escapes the destination", target.display())))?;
    let mut current = dest.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(bad_tar(format!(
                    "entry {} is beneath symlink {}",
                    target.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(io_at(&current)(e)),
        }
    }
    Ok(())
}

fn create_parent(target: &Path) -> Result<(), CopyError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }
    Ok(())
}

/// Extract a tar stream to `dest`. Returns the bytes of file content written.
///
/// If `dest` is an existing directory, entries are placed inside it. If it
/// exists as a file it is overwritten by a single-file archive. Otherwise
/// `dest` is created in place of the archive's root entry.
pub fn extract_archive<R: Read>(reader: R, dest: &Path) -> Result<u64, CopyError> {
    let dest_meta = fs::metadata(dest).ok();
    let placement = match &dest_meta {
        Some(meta) if meta.is_dir() => Placement::Into,
        _ => Placement::Replace,
    };
    let dest_is_file = dest_meta.as_ref().is_some_and(|m| !m.is_dir());

    let mut archive = Archive::new(reader);
    let mut written = 0u64;
    let mut dir_modes = Vec::new();

    for entry in archive.entries().map_err(bad_tar)? {
        let mut entry = entry.map_err(bad_tar)?;
        let raw_path = entry.path().map_err(bad_tar)?.into_owned();
        let parts = entry_components(&raw_path)?;
        if parts.is_empty() {
            continue;
        }
        let target = target_for(dest, placement, &parts);
        let kind = entry.header().entry_type();
        let mode = entry.header().mode().map_err(bad_tar)? & 0o7777;

        if dest_is_file && (parts.len() > 1 || kind == EntryType::Directory) {
            return Err(CopyError::InvalidArgument(format!(
                "cannot copy a directory onto file {}",
                dest.display()
            )));
        }

        check_breakout(dest, &target)?;

        match kind {
            EntryType::Directory => {
                remove_existing(&target).map_err(io_at(&target))?;
                fs::create_dir_all(&target).map_err(io_at(&target))?;
                dir_modes.push((target, mode));
            }
            EntryType::Regular | EntryType::Continuous => {
                create_parent(&target)?;
                remove_existing(&target).map_err(io_at(&target))?;
                let mut file = fs::File::create(&target).map_err(io_at(&target))?;
                written += io::copy(&mut entry, &mut file).map_err(io_at(&target))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(io_at(&target))?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(bad_tar)?
                    .ok_or_else(|| bad_tar(format!("symlink {} has no target", raw_path.display())))?
                    .into_owned();
                create_parent(&target)?;
                remove_existing(&target).map_err(io_at(&target))?;
                std::os::unix::fs::symlink(&link, &target).map_err(io_at(&target))?;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(bad_tar)?
                    .ok_or_else(|| bad_tar(format!("hardlink {} has no target", raw_path.display())))?
                    .into_owned();
                let link_parts = entry_components(&link)?;
                let original = target_for(dest, placement, &link_parts);
                check_breakout(dest, &original)?;
                create_parent(&target)?;
                remove_existing(&target).map_err(io_at(&target))?;
                fs::hard_link(&original, &target).map_err(io_at(&target))?;
            }
            other => {
                debug!(path = %raw_path.display(), kind = ?other, "skipping unsupported entry");
            }
        }
    }

    // Directory modes last, so read-only directories can still be filled.
    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).map_err(io_at(&dir))?;
    }
    Ok(written)
}

// -----------------------------------------------------------------------
// Drivers
// -----------------------------------------------------------------------

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, CopyError>>,
) -> Result<T, CopyError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CopyError::Interrupted),
        result = fut => result,
    }
}

fn join_container_path(base: &str, link: &str) -> String {
    if link.starts_with('/') {
        return link.to_string();
    }
    let parent = Path::new(base).parent().unwrap_or_else(|| Path::new("/"));
    parent.join(link).to_string_lossy().into_owned()
}

/// Copy `path` out of `container` to the host path `dest`, or to `stdout`
/// as a raw tar stream when `dest` is `-`. Returns the bytes transferred.
pub async fn copy_from_container<W>(
    engine: &dyn Engine,
    container: &str,
    path: &str,
    dest: &str,
    options: CopyOptions,
    stdout: &mut W,
    cancel: &CancellationToken,
) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    cancellable(cancel, async {
        let mut path = path.to_string();
        if options.follow_link {
            let stat = engine
                .stat_container_path(container, &path)
                .await
                .map_err(|source| CopyError::Engine {
                    op: format!("reading {container}:{path}"),
                    source,
                })?;
            if stat.is_symlink() && !stat.link_target.is_empty() {
                path = join_container_path(&path, &stat.link_target);
                debug!(target = %path, "following symlink");
            }
        }

        let (stat, mut archive) = engine
            .copy_from_container(container, &path)
            .await
            .map_err(|source| CopyError::Engine {
                op: format!("copying {container}:{path}"),
                source,
            })?;
        debug!(name = %stat.name, size = stat.size, "receiving archive");

        if dest == "-" {
            let n = tokio::io::copy(&mut archive, stdout).await?;
            stdout.flush().await?;
            return Ok(n);
        }

        let dest = PathBuf::from(dest);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(CopyError::SourceMissing(parent.to_path_buf()));
            }
        }
        let bridge = SyncIoBridge::new(archive);
        let written = tokio::task::spawn_blocking(move || extract_archive(bridge, &dest))
            .await
            .map_err(|e| CopyError::Stream(io::Error::other(e)))??;
        info!(container, path = %path, bytes = written, "copied from container");
        Ok(written)
    })
    .await
}

/// Copy the host path `source` (or stdin for `-`) to `path` in `container`.
/// Returns the archive size; zero for stdin.
pub async fn copy_to_container(
    engine: &dyn Engine,
    source: &str,
    container: &str,
    path: &str,
    options: CopyOptions,
    stdin: ArchiveReader,
    cancel: &CancellationToken,
) -> Result<u64, CopyError> {
    let upload_options = CopyToOptions {
        allow_overwrite_dir_with_file: true,
        copy_uid_gid: options.copy_uid_gid,
    };
    let upload_err = |source| CopyError::Engine {
        op: format!("copying to {container}:{path}"),
        source,
    };

    if source == "-" {
        return cancellable(cancel, async {
            engine
                .copy_to_container(container, path, stdin, upload_options)
                .await
                .map_err(upload_err)?;
            Ok(0)
        })
        .await;
    }

    let src = PathBuf::from(source);
    let src_meta = if options.follow_link {
        fs::metadata(&src)
    } else {
        fs::symlink_metadata(&src)
    }
    .map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            CopyError::SourceMissing(src.clone())
        } else {
            io_at(&src)(e)
        }
    })?;

    cancellable(cancel, async {
        // Upload into an existing directory as-is; otherwise into the parent
        // with the archive root renamed to the destination's name.
        let (upload_dir, root_name) = match engine.stat_container_path(container, path).await {
            Ok(stat) if stat.is_dir() => (path.to_string(), base_name(&src)),
            Ok(_) if src_meta.is_dir() => {
                return Err(CopyError::InvalidArgument(format!(
                    "cannot copy a directory onto file {container}:{path}"
                )));
            }
            Ok(_) | Err(EngineError::PathNotFound(_)) => {
                if path.ends_with('/') {
                    return Err(CopyError::InvalidArgument(format!(
                        "destination directory {container}:{path} does not exist"
                    )));
                }
                let dest = Path::new(path);
                let parent = dest
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map_or_else(|| "/".to_string(), |p| p.to_string_lossy().into_owned());
                (parent, base_name(dest))
            }
            Err(source) => return Err(upload_err(source)),
        };

        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let follow = options.follow_link;
        let builder_src = src.clone();
        let builder = tokio::task::spawn_blocking(move || {
            build_archive(&builder_src, &root_name, follow, bridge)
        });

        let upload = engine.copy_to_container(container, &upload_dir, Box::pin(reader), upload_options);
        let (upload, built) = tokio::join!(upload, builder);

        let size = built.map_err(|e| CopyError::Stream(io::Error::other(e)))??;
        upload.map_err(upload_err)?;
        info!(container, path, bytes = size, "copied to container");
        Ok(size)
    })
    .await
}

fn base_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.to_string_lossy().trim_end_matches('/').to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}
