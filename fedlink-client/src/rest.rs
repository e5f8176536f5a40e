use async_trait::async_trait;
use prost::Message as ProstMessage;

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::task::{Fab, Run};

use crate::codec::{message_from_task_ins, run_from_proto, task_res_from_message, Message};
use crate::connection::{Connection, ConnectionError, NodeCell};
use crate::proto;
use crate::retry::RetryInvoker;
use crate::PING_DEFAULT_INTERVAL;

const PATH_CREATE_NODE: &str = "api/v0/fleet/create-node";
const PATH_DELETE_NODE: &str = "api/v0/fleet/delete-node";
const PATH_PULL_TASK_INS: &str = "api/v0/fleet/pull-task-ins";
const PATH_PUSH_TASK_RES: &str = "api/v0/fleet/push-task-res";
const PATH_GET_RUN: &str = "api/v0/fleet/get-run";
const PATH_GET_FAB: &str = "api/v0/fleet/get-fab";

/// REST transport: the same fleet messages, protobuf-encoded, POSTed
/// over HTTP.
pub struct RestConnection {
    http: reqwest::Client,
    base_url: String,
    retry: RetryInvoker,
    node: NodeCell,
}

impl RestConnection {
    pub fn new(base_url: &str, retry: RetryInvoker) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            node: NodeCell::new(),
        })
    }

    async fn post<Req, Res>(&self, path: &str, request: &Req) -> Result<Res, ConnectionError>
    where
        Req: ProstMessage,
        Res: ProstMessage + Default,
    {
        let url = format!("{}/{}", self.base_url, path);
        let body = request.encode_to_vec();

        let bytes = self
            .retry
            .invoke(|| {
                let http = self.http.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/protobuf")
                        .header(reqwest::header::ACCEPT, "application/protobuf")
                        .body(body)
                        .send()
                        .await?
                        .error_for_status()?;
                    response.bytes().await
                }
            })
            .await?;

        Ok(Res::decode(bytes.as_ref())?)
    }

    fn node_ref(node_id: u64) -> proto::NodeRef {
        proto::NodeRef {
            node_id: uint64_to_sint64(node_id),
            anonymous: false,
        }
    }
}

#[async_trait]
impl Connection for RestConnection {
    async fn create_node(&self) -> Result<u64, ConnectionError> {
        let response: proto::CreateNodeResponse = self
            .post(
                PATH_CREATE_NODE,
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
            .post(
                PATH_DELETE_NODE,
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
            .post(
                PATH_PULL_TASK_INS,
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
            .post(
                PATH_PUSH_TASK_RES,
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
            .post(
                PATH_GET_RUN,
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
            .post(
                PATH_GET_FAB,
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
