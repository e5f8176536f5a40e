use async_trait::async_trait;
use tonic::transport::Channel;

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::task::{Fab, Run};

use crate::codec::{message_from_task_ins, run_from_proto, task_res_from_message, Message};
use crate::connection::{Connection, ConnectionError, NodeCell};
use crate::proto;
use crate::proto::fleet_client::FleetClient;
use crate::retry::RetryInvoker;
use crate::PING_DEFAULT_INTERVAL;

/// Request/response gRPC transport: each capability maps onto one
/// Fleet rpc.
pub struct GrpcRereConnection {
    client: FleetClient<Channel>,
    retry: RetryInvoker,
    node: NodeCell,
}

impl GrpcRereConnection {
    pub async fn connect(address: &str, retry: RetryInvoker) -> Result<Self, ConnectionError> {
        let channel = Channel::from_shared(address.to_string())
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?
            .connect()
            .await?;
        Ok(Self {
            client: FleetClient::new(channel),
            retry,
            node: NodeCell::new(),
        })
    }

    fn node_ref(node_id: u64) -> proto::NodeRef {
        proto::NodeRef {
            node_id: uint64_to_sint64(node_id),
            anonymous: false,
        }
    }
}

#[async_trait]
impl Connection for GrpcRereConnection {
    async fn create_node(&self) -> Result<u64, ConnectionError> {
        let response = self
            .retry
            .invoke(|| {
                let mut client = self.client.clone();
                async move {
                    client
                        .create_node(proto::CreateNodeRequest {
                            ping_interval: PING_DEFAULT_INTERVAL,
                        })
                        .await
                }
            })
            .await?;

        let node = response
            .into_inner()
            .node
            .ok_or_else(|| ConnectionError::Protocol("missing node in CreateNode response".into()))?;
        let node_id = sint64_to_uint64(node.node_id);
        self.node.set(node_id);
        tracing::info!(node_id, "registered with the fleet");
        Ok(node_id)
    }

    async fn delete_node(&self) -> Result<(), ConnectionError> {
        let node_id = self.node.get()?;
        self.retry
            .invoke(|| {
                let mut client = self.client.clone();
                async move {
                    client
                        .delete_node(proto::DeleteNodeRequest {
                            node: Some(Self::node_ref(node_id)),
                        })
                        .await
                }
            })
            .await?;
        self.node.clear();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Message>, ConnectionError> {
        let node_id = self.node.get()?;
        let response = self
            .retry
            .invoke(|| {
                let mut client = self.client.clone();
                async move {
                    client
                        .pull_task_ins(proto::PullTaskInsRequest {
                            node: Some(Self::node_ref(node_id)),
                        })
                        .await
                }
            })
            .await?;

        Ok(response
            .into_inner()
            .task_ins_list
            .into_iter()
            .next()
            .map(message_from_task_ins))
    }

    async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.node.get()?;
        let task_res = task_res_from_message(&message);

        let response = self
            .retry
            .invoke(|| {
                let mut client = self.client.clone();
                let task_res = task_res.clone();
                async move {
                    client
                        .push_task_res(proto::PushTaskResRequest {
                            task_res_list: vec![task_res],
                        })
                        .await
                }
            })
            .await?;

        let results = response.into_inner().results;
        if results.values().any(|&status| status != 0) {
            return Err(ConnectionError::Protocol(
                "link server refused the pushed result".into(),
            ));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: u64) -> Result<Run, ConnectionError> {
        let response = self
            .retry
            .invoke(|| {
                let mut client = self.client.clone();
                async move {
                    client
                        .get_run(proto::GetRunRequest {
                            run_id: uint64_to_sint64(run_id),
                        })
                        .await
                }
            })
            .await?;

        let run = response
            .into_inner()
            .run
            .ok_or_else(|| ConnectionError::Protocol("missing run in GetRun response".into()))?;
        Ok(run_from_proto(run))
    }

    async fn get_fab(&self, fab_hash: &str) -> Result<Fab, ConnectionError> {
        let hash_str = fab_hash.to_string();
        let response = self
            .retry
            .invoke(|| {
                let mut client = self.client.clone();
                let hash_str = hash_str.clone();
                async move { client.get_fab(proto::GetFabRequest { hash_str }).await }
            })
            .await?;

        let fab = response
            .into_inner()
            .fab
            .ok_or_else(|| ConnectionError::Protocol("missing fab in GetFab response".into()))?;
        Ok(Fab {
            hash_str: fab.hash_str,
            content: fab.content,
        })
    }
}
