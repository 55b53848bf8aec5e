//! Exec-in-container with bounded output capture

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bytes::BytesMut;
use futures_util::StreamExt;
use tracing::debug;

use super::daemon::{map_err, DockerDriver};
use super::driver::{DriverError, DriverResult, ExecOptions, ExecOutput};

/// Run a command inside a running container
///
/// Stdout and stderr are captured into separate buffers capped at
/// `opts.buffer_limit` bytes each; overflow is dropped and flagged. The
/// container's own state is unaffected by the exec outcome.
pub(crate) async fn exec_in_container(
    driver: &DockerDriver,
    id: &str,
    argv: &[String],
    opts: &ExecOptions,
) -> DriverResult<ExecOutput> {
    if argv.is_empty() {
        return Err(DriverError::InvalidSpec("exec argv must not be empty".into()));
    }

    let env: Vec<String> = opts
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let create = CreateExecOptions {
        cmd: Some(argv.to_vec()),
        env: if env.is_empty() { None } else { Some(env) },
        working_dir: opts.working_dir.clone(),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };

    let exec = driver
        .docker()
        .create_exec(id, create)
        .await
        .map_err(|e| map_err(e, id))?;

    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();
    let mut truncated = false;

    let capture = async {
        let started = driver
            .docker()
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_err(e, id))?;

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        truncated |= append_bounded(&mut stdout, &message, opts.buffer_limit);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        truncated |= append_bounded(&mut stderr, &message, opts.buffer_limit);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("exec output stream ended for {}: {}", id, e);
                        break;
                    }
                }
            }
        }
        Ok::<(), DriverError>(())
    };

    tokio::time::timeout(opts.timeout, capture)
        .await
        .map_err(|_| DriverError::Timeout)??;

    let inspect = driver
        .docker()
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| map_err(e, id))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: inspect.exit_code.unwrap_or(-1),
        truncated,
    })
}

/// Append up to the remaining capacity; returns true if data was dropped
fn append_bounded(buf: &mut BytesMut, data: &[u8], limit: usize) -> bool {
    let remaining = limit.saturating_sub(buf.len());
    if data.len() <= remaining {
        buf.extend_from_slice(data);
        false
    } else {
        buf.extend_from_slice(&data[..remaining]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_within_limit() {
        let mut buf = BytesMut::new();
        assert!(!append_bounded(&mut buf, b"hello", 64));
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_append_truncates_at_limit() {
        let mut buf = BytesMut::new();
        assert!(!append_bounded(&mut buf, b"hello", 8));
        assert!(append_bounded(&mut buf, b"world!", 8));
        assert_eq!(&buf[..], b"hellowor");
        assert_eq!(buf.len(), 8);

        // Once full, everything is dropped
        assert!(append_bounded(&mut buf, b"more", 8));
        assert_eq!(buf.len(), 8);
    }
}
