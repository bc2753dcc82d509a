//! Communicator that runs commands and transfers files on the host itself.

use std::io;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{CommFuture, Communicator, CommunicatorError, FileMode, RemoteCmd, launch};

/// Runs commands with `sh -c` on the local machine.
///
/// Relative paths resolve against the working directory when one is set.
#[derive(Clone, Debug, Default)]
pub struct LocalCommunicator {
    working_dir: Option<Utf8PathBuf>,
}

impl LocalCommunicator {
    /// Creates a communicator using the process's working directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a communicator rooted at `dir`.
    #[must_use]
    pub fn in_dir(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }

    fn resolve(&self, path: &str) -> Utf8PathBuf {
        let candidate = Utf8Path::new(path);
        match &self.working_dir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> CommunicatorError {
    CommunicatorError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

fn staging_path(target: &Utf8Path) -> Utf8PathBuf {
    let name = target.file_name().unwrap_or("upload");
    target.with_file_name(format!(".{name}.kiln-{}", Uuid::new_v4().simple()))
}

async fn copy_tree_blocking(
    source: Utf8PathBuf,
    destination: Utf8PathBuf,
    exclude: Vec<String>,
) -> Result<(), CommunicatorError> {
    let origin = source.clone();
    tokio::task::spawn_blocking(move || copy_tree(&source, &destination, &exclude))
        .await
        .map_err(|err| CommunicatorError::Io {
            path: origin.to_string(),
            message: err.to_string(),
        })?
        .map_err(|err| io_error(&origin, &err))
}

fn copy_tree(source: &Utf8Path, destination: &Utf8Path, exclude: &[String]) -> io::Result<()> {
    let target = if source.as_str().ends_with('/') {
        destination.to_path_buf()
    } else {
        let name = source.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "source has no directory name")
        })?;
        destination.join(name)
    };

    let from = Dir::open_ambient_dir(source, ambient_authority())?;
    Dir::create_ambient_dir_all(&target, ambient_authority())?;
    let to = Dir::open_ambient_dir(&target, ambient_authority())?;
    copy_entries(&from, &to, exclude)
}

fn copy_entries(from: &Dir, to: &Dir, exclude: &[String]) -> io::Result<()> {
    for item in from.entries()? {
        let entry = item?;
        let name = entry.file_name()?;
        if exclude.iter().any(|pattern| *pattern == name) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            to.create_dir_all(&name)?;
            copy_entries(&entry.open_dir()?, &to.open_dir(&name)?, exclude)?;
        } else {
            to.write(&name, from.read(&name)?)?;
        }
    }
    Ok(())
}

impl Communicator for LocalCommunicator {
    fn start<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        cmd: &'a mut RemoteCmd,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let mut command = Command::new("sh");
            command.arg("-c").arg(cmd.command());
            if let Some(dir) = &self.working_dir {
                command.current_dir(dir);
            }
            launch(command, "sh", cancel, cmd, None)
        })
    }

    fn upload<'a>(
        &'a self,
        path: &'a str,
        source: &'a mut (dyn AsyncRead + Send + Unpin),
        mode: FileMode,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let target = self.resolve(path);
            let mut bytes = Vec::new();
            source
                .read_to_end(&mut bytes)
                .await
                .map_err(|err| io_error(&target, &err))?;

            let staging = staging_path(&target);
            let staged = async {
                tokio::fs::write(&staging, &bytes).await?;
                tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(mode.0))
                    .await?;
                tokio::fs::rename(&staging, &target).await
            };
            if let Err(err) = staged.await {
                tokio::fs::remove_file(&staging).await.ok();
                return Err(io_error(&target, &err));
            }
            Ok(())
        })
    }

    fn upload_dir<'a>(
        &'a self,
        destination: &'a str,
        source: &'a Utf8Path,
        exclude: &'a [String],
    ) -> CommFuture<'a, ()> {
        Box::pin(copy_tree_blocking(
            source.to_path_buf(),
            self.resolve(destination),
            exclude.to_vec(),
        ))
    }

    fn download<'a>(
        &'a self,
        path: &'a str,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let origin = self.resolve(path);
            let bytes = tokio::fs::read(&origin)
                .await
                .map_err(|err| io_error(&origin, &err))?;
            sink.write_all(&bytes)
                .await
                .map_err(|err| io_error(&origin, &err))?;
            sink.flush().await.map_err(|err| io_error(&origin, &err))
        })
    }

    fn download_dir<'a>(
        &'a self,
        source: &'a str,
        destination: &'a Utf8Path,
        exclude: &'a [String],
    ) -> CommFuture<'a, ()> {
        let mut origin = self.resolve(source);
        if source.ends_with('/') && !origin.as_str().ends_with('/') {
            origin = Utf8PathBuf::from(format!("{origin}/"));
        }
        Box::pin(copy_tree_blocking(
            origin,
            destination.to_path_buf(),
            exclude.to_vec(),
        ))
    }
}
