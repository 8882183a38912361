/// The node file lists the inference nodes the router may dispatch to. It is read once at
/// startup and, optionally, watched for changes so newly added nodes can be picked up without a
/// restart.
use crate::errors::RouterError;
use crate::node::NodeSpec;
use async_trait::async_trait;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesFile {
    pub nodes: Vec<NodeSpec>,
}

impl NodesFile {
    pub async fn load(path: &Path) -> Result<Self, RouterError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            RouterError::Configuration(format!(
                "Failed to read node file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&contents).map_err(|e| match e {
            RouterError::Configuration(msg) => {
                RouterError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parses and validates a node file. Ids must be unique within the file.
    pub fn parse(contents: &str) -> Result<Self, RouterError> {
        let file: NodesFile = serde_json::from_str(contents)
            .map_err(|e| RouterError::Configuration(format!("malformed node file: {e}")))?;

        let mut seen = HashSet::new();
        for spec in &file.nodes {
            spec.validate()?;
            if !seen.insert(spec.id.as_str()) {
                return Err(RouterError::Configuration(format!(
                    "node {} is listed more than once",
                    spec.id
                )));
            }
        }
        Ok(file)
    }
}

#[async_trait]
pub trait NodesStream {
    async fn receive(&self)
    -> Result<mpsc::Receiver<Result<NodesFile, RouterError>>, RouterError>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl NodesStream for WatchedFile {
    /// Watches the node file and yields a freshly parsed copy on every modification.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<NodesFile, RouterError>>, RouterError> {
        let (nodes_tx, nodes_rx) = mpsc::channel(100);
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|e| RouterError::Configuration(format!("cannot watch node file: {e}")))?;

        watcher
            .watch(&self.0, RecursiveMode::NonRecursive)
            .map_err(|e| {
                RouterError::Configuration(format!(
                    "cannot watch node file {}: {e}",
                    self.0.display()
                ))
            })?;

        let path = self.0.clone();
        tokio::spawn(async move {
            // Dropping the watcher stops notifications, so it lives as long as this task.
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Node file changed, reloading nodes...");
                        NodesFile::load(&path).await
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Watch error: {}", e);
                        Err(RouterError::Configuration(format!("watch error: {e}")))
                    }
                };
                if nodes_tx.send(update).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(nodes_rx)
    }
}
