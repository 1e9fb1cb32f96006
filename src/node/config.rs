use tokio::runtime::Handle;

use std::sync::Arc;

use crate::local::NodeDirectories;
use crate::msg::NodeId;
use crate::node::Node;
use crate::Result;

/// Configuration of a Node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub node_id: NodeId,
    pub directories: NodeDirectories,
    pub handle: Option<Handle>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: String::new(),
            node_id: NodeId::any(),
            directories: NodeDirectories::default(),
            handle: None,
        }
    }
}

impl NodeConfig {
    /// Create an unnamed node configuration with default run directories
    pub fn new() -> NodeConfig {
        NodeConfig::default()
    }

    /// Set the NodeName
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set a fixed NodeID
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Override the run directories used for local discovery
    pub fn directories(mut self, directories: NodeDirectories) -> Self {
        self.directories = directories;
        self
    }

    /// Spawn transport tasks on an existing runtime
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Construct a Node from the configuration. A runtime is created when no
    /// handle was given and none is current.
    pub fn build(self) -> Result<Arc<Node>> {
        let (handle, runtime) = match self.handle.clone() {
            Some(handle) => (handle, None),
            None => match Handle::try_current() {
                Ok(handle) => (handle, None),
                Err(_) => {
                    let runtime = tokio::runtime::Runtime::new()?;
                    (runtime.handle().clone(), Some(runtime))
                }
            },
        };
        Ok(Arc::new(Node::from_config(self, handle, runtime)))
    }
}
