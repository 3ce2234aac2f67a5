#[macro_use]
extern crate error_chain;

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod executor;
pub mod fingerprint;
pub mod manager;
pub mod membership;
pub mod node;
pub mod resources;
pub mod safety;
pub mod search;
pub mod state;
pub mod store;
pub mod workload;

#[cfg(test)]
mod testing;

pub mod errors {
    use crate::search::{AllocationMode, HealthStatus};

    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            HttpRequest(reqwest::Error);
            Kube(kube::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
        }

        errors {
            UnacceptableHealth(observed: HealthStatus, acceptable: Vec<HealthStatus>) {
                description("cluster health is not acceptable")
                display("cluster health is {}, waiting for one of {:?}", observed, acceptable)
            }
            AllocationNotAcknowledged(mode: Option<AllocationMode>) {
                description("shard allocation change was not acknowledged")
                display("shard allocation change to {} was not acknowledged",
                    mode.as_ref().map(|m| m.as_str()).unwrap_or("default"))
            }
            NodeStillMember(node: String) {
                description("node did not leave the cluster")
                display("node {} is still a cluster member while other nodes are serving", node)
            }
            NodesStillServing(nodes: Vec<String>) {
                description("nodes are still serving")
                display("nodes still serving after scale down: {:?}", nodes)
            }
            NodesNotRejoined(nodes: Vec<String>) {
                description("nodes have not rejoined the cluster")
                display("waiting for nodes to rejoin the cluster: {:?}", nodes)
            }
            NodesNotJoined(expected: i32, seen: i32) {
                description("cluster does not count every ready node yet")
                display("cluster counts {} nodes, waiting for {}", seen, expected)
            }
            WorkloadMissing(name: String) {
                description("workload record not found")
                display("workload {} not found", name)
            }
            InvalidOperation(reason: String) {
                description("invalid operation")
                display("invalid operation: {}", reason)
            }
            AdminStatus(code: u16, body: String) {
                description("administrative API returned an error status")
                display("administrative API returned {}: {}", code, body)
            }
            StatusConflict(name: String) {
                description("status write kept conflicting")
                display("status of {} kept changing underneath the write", name)
            }
        }
    }

    impl Error {
        /// Whether the next reconciliation pass is expected to make progress
        /// without anyone changing the resource.
        pub fn is_retryable(&self) -> bool {
            match self.kind() {
                ErrorKind::UnacceptableHealth(..)
                | ErrorKind::AllocationNotAcknowledged(..)
                | ErrorKind::NodeStillMember(..)
                | ErrorKind::NodesStillServing(..)
                | ErrorKind::NodesNotRejoined(..)
                | ErrorKind::NodesNotJoined(..)
                | ErrorKind::AdminStatus(..)
                | ErrorKind::StatusConflict(..)
                | ErrorKind::HttpRequest(..)
                | ErrorKind::Kube(..)
                | ErrorKind::Io(..) => true,
                _ => false,
            }
        }
    }
}

/*
A pass over a SearchCluster never blocks on the cluster for long. Every
disruptive step is recorded in the status sub-resource before the next one is
considered, so a controller restart picks the operation up where it left off:

- cluster-wide operations checkpoint through the Restarting/UpdatingSettings/Recovering
  conditions.
- single node operations checkpoint through the node's upgrade status, and only one
  node is ever under upgrade at a time.

Waiting for nodes to come back is a failed pass, not a sleep. The controller
requeues and the next pass re-checks membership.
*/
