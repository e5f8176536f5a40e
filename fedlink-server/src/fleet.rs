use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::state::LinkState;

use crate::fab::FabProvider;
use crate::grpc::proto::fleet_server::Fleet;
use crate::grpc::proto::{
    CreateNodeRequest, CreateNodeResponse, DeleteNodeRequest, DeleteNodeResponse, GetFabRequest,
    GetFabResponse, GetRunRequest, GetRunResponse, PingRequest, PingResponse, PullTaskInsRequest,
    PullTaskInsResponse, PushTaskResRequest, PushTaskResResponse,
};
use crate::grpc::{proto, run_to_proto, state_err, task_ins_to_proto, task_res_from_proto};

/// Node-facing servicer: a thin skin over the link state plus the FAB
/// content provider.
pub struct FleetService {
    state: Arc<dyn LinkState>,
    fabs: Arc<dyn FabProvider>,
}

impl FleetService {
    pub fn new(state: Arc<dyn LinkState>, fabs: Arc<dyn FabProvider>) -> Self {
        Self { state, fabs }
    }
}

#[allow(clippy::result_large_err)]
fn required_node(node: Option<proto::NodeRef>) -> Result<proto::NodeRef, Status> {
    node.ok_or_else(|| Status::invalid_argument("`node` is required"))
}

#[tonic::async_trait]
impl Fleet for FleetService {
    async fn create_node(
        &self,
        request: Request<CreateNodeRequest>,
    ) -> Result<Response<CreateNodeResponse>, Status> {
        let req = request.into_inner();
        let node_id = self
            .state
            .create_node(req.ping_interval, None)
            .await
            .map_err(state_err)?;
        tracing::info!(node_id, "node registered");

        Ok(Response::new(CreateNodeResponse {
            node: Some(proto::NodeRef {
                node_id: uint64_to_sint64(node_id),
                anonymous: false,
            }),
        }))
    }

    async fn delete_node(
        &self,
        request: Request<DeleteNodeRequest>,
    ) -> Result<Response<DeleteNodeResponse>, Status> {
        let node = required_node(request.into_inner().node)?;
        let node_id = sint64_to_uint64(node.node_id);
        self.state
            .delete_node(node_id, None)
            .await
            .map_err(|e| Status::not_found(format!("{e:#}")))?;
        tracing::info!(node_id, "node deleted");
        Ok(Response::new(DeleteNodeResponse {}))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        let node = required_node(req.node)?;
        let success = self
            .state
            .acknowledge_ping(sint64_to_uint64(node.node_id), req.ping_interval)
            .await
            .map_err(state_err)?;
        Ok(Response::new(PingResponse { success }))
    }

    async fn pull_task_ins(
        &self,
        request: Request<PullTaskInsRequest>,
    ) -> Result<Response<PullTaskInsResponse>, Status> {
        let node = required_node(request.into_inner().node)?;
        let node_id = if node.anonymous {
            None
        } else {
            Some(sint64_to_uint64(node.node_id))
        };

        let task_ins_list = self
            .state
            .get_task_ins(node_id, Some(1))
            .await
            .map_err(|e| Status::invalid_argument(format!("{e:#}")))?;

        Ok(Response::new(PullTaskInsResponse {
            task_ins_list: task_ins_list.into_iter().map(task_ins_to_proto).collect(),
        }))
    }

    async fn push_task_res(
        &self,
        request: Request<PushTaskResRequest>,
    ) -> Result<Response<PushTaskResResponse>, Status> {
        let req = request.into_inner();
        let mut results = HashMap::new();

        for res in req.task_res_list {
            let res = task_res_from_proto(res);
            // Refusals have no minted id; key them by the instruction
            // they answered so the pusher can correlate.
            let ancestor = res.task.ancestry.first().cloned().unwrap_or_default();
            match self.state.store_task_res(res).await.map_err(state_err)? {
                Some(task_id) => {
                    results.insert(task_id, 0);
                }
                None => {
                    results.insert(ancestor, 1);
                }
            }
        }

        Ok(Response::new(PushTaskResResponse { results }))
    }

    async fn get_run(
        &self,
        request: Request<GetRunRequest>,
    ) -> Result<Response<GetRunResponse>, Status> {
        let run_id = sint64_to_uint64(request.into_inner().run_id);
        let run = self
            .state
            .get_run(run_id)
            .await
            .map_err(state_err)?
            .ok_or_else(|| Status::not_found(format!("run {run_id} not found")))?;
        Ok(Response::new(GetRunResponse {
            run: Some(run_to_proto(run)),
        }))
    }

    async fn get_fab(
        &self,
        request: Request<GetFabRequest>,
    ) -> Result<Response<GetFabResponse>, Status> {
        let hash_str = request.into_inner().hash_str;
        let fab = self
            .fabs
            .get(&hash_str)
            .await
            .map_err(state_err)?
            .ok_or_else(|| Status::not_found(format!("no bundle with hash {hash_str}")))?;
        Ok(Response::new(GetFabResponse {
            fab: Some(proto::Fab {
                hash_str: fab.hash_str,
                content: fab.content,
            }),
        }))
    }
}
