use std::sync::Arc;

use crate::common::Map;
use crate::config::QueueConfig;
use crate::QueueName;

/// One node of the configured queue tree of a partition.
///
/// Built once from the partition configuration; the shape never changes at
/// runtime. Applications may only be admitted to leaf queues.
#[derive(Debug)]
pub struct QueueInfo {
    pub name: String,
    /// Dotted path from the root, e.g. `root.tenants.alice`.
    pub full_path: QueueName,
    pub is_leaf: bool,
    pub properties: Map<String, String>,
    children: Map<String, Arc<QueueInfo>>,
}

impl QueueInfo {
    pub fn from_config(config: &QueueConfig) -> Arc<QueueInfo> {
        Self::build(config, None)
    }

    fn build(config: &QueueConfig, parent_path: Option<&str>) -> Arc<QueueInfo> {
        let full_path = match parent_path {
            Some(parent) => format!("{parent}.{}", config.name),
            None => config.name.clone(),
        };
        let children: Map<String, Arc<QueueInfo>> = config
            .queues
            .iter()
            .map(|child| {
                (
                    child.name.clone(),
                    Self::build(child, Some(full_path.as_str())),
                )
            })
            .collect();
        Arc::new(QueueInfo {
            name: config.name.clone(),
            full_path,
            is_leaf: children.is_empty(),
            properties: config.properties.clone(),
            children,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<QueueInfo>> {
        self.children.values()
    }

    /// Flatten the subtree into `queues`, keyed by full path.
    pub fn collect_into(self: &Arc<QueueInfo>, queues: &mut Map<QueueName, Arc<QueueInfo>>) {
        queues.insert(self.full_path.clone(), self.clone());
        for child in self.children.values() {
            child.collect_into(queues);
        }
    }
}
