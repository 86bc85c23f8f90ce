//! Docker-compatible runtime client over bollard.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use super::{ContainerRuntime, ContainerSummary, ExecChunk, ExecStream, StreamKind, VersionInfo};
use crate::error::{Error, Result};
use crate::tls::TlsMaterial;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Bollard-backed [`ContainerRuntime`].
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect per the configured endpoint scheme. TLS material is
    /// required for `https://` and honored for `tcp://`.
    pub fn connect(runtime_url: &str, tls: Option<&TlsMaterial>) -> Result<Self> {
        let docker = if runtime_url.starts_with("unix://") {
            Docker::connect_with_unix(
                runtime_url,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
        } else if let Some(material) = tls {
            Docker::connect_with_ssl(
                runtime_url,
                &material.key_path,
                &material.cert_path,
                &material.ca_path,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
        } else if runtime_url.starts_with("https://") {
            return Err(Error::Security(
                "https runtime endpoint requires BT_SSL with CA, cert and key".into(),
            ));
        } else {
            Docker::connect_with_http(
                runtime_url,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
        }
        .map_err(map_error)?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        env: &[String],
    ) -> Result<ExecStream> {
        let options = CreateExecOptions::<String> {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd.to_vec()),
            env: Some(env.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(map_error)?;
        debug!(container = container_id, exec_id = %exec.id, "exec created");

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_error)?
        {
            StartExecResults::Attached { output, .. } => {
                let chunks = output.filter_map(|item| async move {
                    match item {
                        Ok(bollard::container::LogOutput::StdOut { message })
                        | Ok(bollard::container::LogOutput::Console { message }) => {
                            Some(Ok(ExecChunk {
                                kind: StreamKind::Stdout,
                                bytes: message,
                            }))
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            Some(Ok(ExecChunk {
                                kind: StreamKind::Stderr,
                                bytes: message,
                            }))
                        }
                        Ok(bollard::container::LogOutput::StdIn { .. }) => None,
                        Err(e) => Some(Err(map_error(e))),
                    }
                });

                // Once the output stream drains, surface a non-zero exit
                // status as a runtime error so the pipeline does not
                // mistake a failed dump for an empty one.
                let docker = self.docker.clone();
                let exec_id = exec.id.clone();
                let exit_check = futures::stream::once(async move {
                    match docker.inspect_exec(&exec_id).await {
                        Ok(info) => match info.exit_code {
                            Some(code) if code != 0 => Some(Err(Error::Runtime(format!(
                                "dump command exited with status {code}"
                            )))),
                            _ => None,
                        },
                        Err(e) => Some(Err(map_error(e))),
                    }
                })
                .filter_map(|item| async move { item });

                Ok(Box::pin(chunks.chain(exit_check)))
            }
            StartExecResults::Detached => {
                Err(Error::Runtime("exec unexpectedly detached".into()))
            }
        }
    }

    async fn version(&self) -> Result<VersionInfo> {
        let version = self.docker.version().await.map_err(map_error)?;
        Ok(VersionInfo {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }
}

/// Map bollard failures onto the engine's taxonomy: timeouts retry
/// differently from plain transport errors.
fn map_error(error: bollard::errors::Error) -> Error {
    use bollard::errors::Error as Bollard;
    match error {
        Bollard::RequestTimeoutError => {
            Error::RuntimeTimeout("runtime request timed out".into())
        }
        Bollard::IOError { ref err } if err.kind() == std::io::ErrorKind::TimedOut => {
            Error::RuntimeTimeout(error.to_string())
        }
        other => {
            let text = other.to_string();
            if text.to_ascii_lowercase().contains("timeout") {
                Error::RuntimeTimeout(text)
            } else {
                Error::Runtime(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let err = map_error(bollard::errors::Error::RequestTimeoutError);
        assert!(matches!(err, Error::RuntimeTimeout(_)));
        assert!(err.is_retryable());

        let err = map_error(bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::TimedOut, "slow socket"),
        });
        assert!(matches!(err, Error::RuntimeTimeout(_)));

        let err = map_error(bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no daemon"),
        });
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_https_without_tls_rejected() {
        let result = DockerRuntime::connect("https://docker.example:2376", None);
        assert!(matches!(result, Err(Error::Security(_))));
    }
}
