//! Container runtime driver backed by the Docker Engine API.

use std::collections::HashMap;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::secret::{
    ContainerInspectResponse, HostConfig, Resources, RestartPolicy, RestartPolicyNameEnum,
};
use futures_util::stream::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use super::Config;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker client error: {0}")]
    Client(#[source] bollard::errors::Error),

    #[error("pulling image {image} failed: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("creating container failed: {0}")]
    ContainerCreate(#[source] bollard::errors::Error),

    #[error("starting container failed: {0}")]
    ContainerStart(#[source] bollard::errors::Error),

    #[error("stopping container failed: {0}")]
    ContainerStop(#[source] bollard::errors::Error),

    #[error("removing container failed: {0}")]
    ContainerRemove(#[source] bollard::errors::Error),

    #[error("inspecting container failed: {0}")]
    ContainerInspect(#[source] bollard::errors::Error),
}

pub type DockerResult<T> = Result<T, DockerError>;

/// One driver instance per task operation, configured from the task.
pub struct Docker {
    client: bollard::Docker,
    config: Config,
}

impl Docker {
    pub fn new(config: Config) -> DockerResult<Self> {
        let client = bollard::Docker::connect_with_unix_defaults().map_err(DockerError::Client)?;
        Ok(Docker { client, config })
    }

    /// Pull the image, then create and start the container. Returns the new
    /// container id.
    pub async fn run(&self) -> DockerResult<String> {
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: self.config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %self.config.image, %status, "pulling image");
                    }
                }
                Err(e) => {
                    return Err(DockerError::ImagePull {
                        image: self.config.image.clone(),
                        source: e,
                    });
                }
            }
        }

        let restart_policy = RestartPolicy {
            name: Some(match self.config.restart_policy.as_str() {
                "always" => RestartPolicyNameEnum::ALWAYS,
                "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
                "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                _ => RestartPolicyNameEnum::NO,
            }),
            maximum_retry_count: None,
        };

        let resources = Resources {
            memory: Some(self.config.memory),
            nano_cpus: Some((self.config.cpu * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: resources.memory,
            nano_cpus: resources.nano_cpus,
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .config
            .exposed_ports
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            env: Some(self.config.env.clone()),
            cmd: if self.config.cmd.is_empty() {
                None
            } else {
                Some(self.config.cmd.clone())
            },
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: self.config.name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(DockerError::ContainerCreate)?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(DockerError::ContainerStart)?;

        info!(container_id = %created.id, image = %self.config.image, "container started");
        Ok(created.id)
    }

    /// Stop and remove the container.
    pub async fn stop(&self, container_id: &str) -> DockerResult<()> {
        debug!(%container_id, "stopping container");
        self.client
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .map_err(DockerError::ContainerStop)?;
        self.client
            .remove_container(container_id, None::<RemoveContainerOptions>)
            .await
            .map_err(DockerError::ContainerRemove)?;
        info!(%container_id, "container stopped and removed");
        Ok(())
    }

    /// Inspect the container. `Ok(None)` means the runtime no longer knows
    /// the container id.
    pub async fn inspect(
        &self,
        container_id: &str,
    ) -> DockerResult<Option<ContainerInspectResponse>> {
        match self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Ok(Some(container)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(DockerError::ContainerInspect(e)),
        }
    }
}
