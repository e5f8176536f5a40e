use std::collections::HashMap;

use async_trait::async_trait;
use tonic::transport::Channel;

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::task::{Fab, Run};

use crate::codec::{message_from_task_ins, run_from_proto, task_res_from_message, Message};
use crate::connection::{Connection, ConnectionError, NodeCell};
use crate::proto;
use crate::proto::grpc_adapter_client::GrpcAdapterClient;
use crate::retry::RetryInvoker;
use crate::PING_DEFAULT_INTERVAL;

/// Byte-envelope transport: every Fleet call rides one `SendReceive`
/// rpc, the concrete message wrapped in a `MessageContainer` that
/// names its type.
pub struct GrpcAdapterConnection {
    client: GrpcAdapterClient<Channel>,
    retry: RetryInvoker,
    node: NodeCell,
}

impl GrpcAdapterConnection {
    pub async fn connect(address: &str, retry: RetryInvoker) -> Result<Self, ConnectionError> {
        let channel = Channel::from_shared(address.to_string())
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?
            .connect()
            .await?;
        Ok(Self {
            client: GrpcAdapterClient::new(channel),
            retry,
            node: NodeCell::new(),
        })
    }

    /// Envelope round-trip: encode the request under its type name,
    /// expect the paired response type back.
    async fn send_receive<Req, Res>(
        &self,
        request_name: &str,
        response_name: &str,
        request: &Req,
    ) -> Result<Res, ConnectionError>
    where
        Req: prost::Message,
        Res: prost::Message + Default,
    {
        let container = proto::MessageContainer {
            metadata: HashMap::new(),
            grpc_message_name: request_name.to_string(),
            grpc_message_content: request.encode_to_vec(),
        };

        let response = self
            .retry
            .invoke(|| {
                let mut client = self.client.clone();
                let container = container.clone();
                async move { client.send_receive(container).await }
            })
            .await?;

        let container = response.into_inner();
        if container.grpc_message_name != response_name {
            return Err(ConnectionError::Protocol(format!(
                "expected {response_name} in envelope, got {}",
                container.grpc_message_name
            )));
        }
        Ok(Res::decode(container.grpc_message_content.as_slice())?)
    }

    fn node_ref(node_id: u64) -> proto::NodeRef {
        proto::NodeRef {
            node_id: uint64_to_sint64(node_id),
            anonymous: false,
        }
    }
}

#[async_trait]
impl Connection for GrpcAdapterConnection {
    async fn create_node(&self) -> Result<u64, ConnectionError> {
        let response: proto::CreateNodeResponse = self
            .send_receive(
                "CreateNodeRequest",
                "CreateNodeResponse",
                &proto::CreateNodeRequest {
                    ping_interval: PING_DEFAULT_INTERVAL,
                },
            )
            .await?;

        let node = response
            .node
            .ok_or_else(|| ConnectionError::Protocol("missing node in CreateNode response".into()))?;
        let node_id = sint64_to_uint64(node.node_id);
        self.node.set(node_id);
        Ok(node_id)
    }

    async fn delete_node(&self) -> Result<(), ConnectionError> {
        let node_id = self.node.get()?;
        let _: proto::DeleteNodeResponse = self
            .send_receive(
                "DeleteNodeRequest",
                "DeleteNodeResponse",
                &proto::DeleteNodeRequest {
                    node: Some(Self::node_ref(node_id)),
                },
            )
            .await?;
        self.node.clear();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Message>, ConnectionError> {
        let node_id = self.node.get()?;
        let response: proto::PullTaskInsResponse = self
            .send_receive(
                "PullTaskInsRequest",
                "PullTaskInsResponse",
                &proto::PullTaskInsRequest {
                    node: Some(Self::node_ref(node_id)),
                },
            )
            .await?;

        Ok(response
            .task_ins_list
            .into_iter()
            .next()
            .map(message_from_task_ins))
    }

    async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.node.get()?;
        let task_res = task_res_from_message(&message);
        let response: proto::PushTaskResResponse = self
            .send_receive(
                "PushTaskResRequest",
                "PushTaskResResponse",
                &proto::PushTaskResRequest {
                    task_res_list: vec![task_res],
                },
            )
            .await?;

        if response.results.values().any(|&status| status != 0) {
            return Err(ConnectionError::Protocol(
                "link server refused the pushed result".into(),
            ));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: u64) -> Result<Run, ConnectionError> {
        let response: proto::GetRunResponse = self
            .send_receive(
                "GetRunRequest",
                "GetRunResponse",
                &proto::GetRunRequest {
                    run_id: uint64_to_sint64(run_id),
                },
            )
            .await?;

        let run = response
            .run
            .ok_or_else(|| ConnectionError::Protocol("missing run in GetRun response".into()))?;
        Ok(run_from_proto(run))
    }

    async fn get_fab(&self, fab_hash: &str) -> Result<Fab, ConnectionError> {
        let response: proto::GetFabResponse = self
            .send_receive(
                "GetFabRequest",
                "GetFabResponse",
                &proto::GetFabRequest {
                    hash_str: fab_hash.to_string(),
                },
            )
            .await?;

        let fab = response
            .fab
            .ok_or_else(|| ConnectionError::Protocol("missing fab in GetFab response".into()))?;
        Ok(Fab {
            hash_str: fab.hash_str,
            content: fab.content,
        })
    }
}
