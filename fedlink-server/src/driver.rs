use std::collections::HashSet;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::state::LinkState;
use fedlink_core::task::{now_epoch, now_rfc3339};
use fedlink_core::validate::validate_task_ins;

use crate::grpc::proto::driver_server::Driver;
use crate::grpc::proto::{
    GetNodesRequest, GetNodesResponse, GetRunRequest, GetRunResponse, PullTaskResRequest,
    PullTaskResResponse, PushTaskInsRequest, PushTaskInsResponse,
};
use crate::grpc::{proto, run_to_proto, state_err, task_ins_from_proto, task_res_to_proto};

/// Orchestrator-facing servicer.
pub struct DriverService {
    state: Arc<dyn LinkState>,
}

impl DriverService {
    pub fn new(state: Arc<dyn LinkState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl Driver for DriverService {
    async fn push_task_ins(
        &self,
        request: Request<PushTaskInsRequest>,
    ) -> Result<Response<PushTaskInsResponse>, Status> {
        let req = request.into_inner();
        let mut task_ids = Vec::with_capacity(req.task_ins_list.len());

        for ins in req.task_ins_list {
            let mut ins = task_ins_from_proto(ins);
            ins.task.created_at = now_rfc3339();
            ins.task.pushed_at = now_epoch();

            let errors = validate_task_ins(&ins);
            if !errors.is_empty() {
                return Err(Status::invalid_argument(errors.join("; ")));
            }

            // Ids arrive in request order; a refused entry reports "".
            let task_id = self.state.store_task_ins(ins).await.map_err(state_err)?;
            task_ids.push(task_id.unwrap_or_default());
        }

        Ok(Response::new(PushTaskInsResponse { task_ids }))
    }

    async fn pull_task_res(
        &self,
        request: Request<PullTaskResRequest>,
    ) -> Result<Response<PullTaskResResponse>, Status> {
        let req = request.into_inner();
        let task_ids: HashSet<String> = req.task_ids.into_iter().collect();

        let task_res_list = self
            .state
            .get_task_res(&task_ids, None)
            .await
            .map_err(state_err)?;

        Ok(Response::new(PullTaskResResponse {
            task_res_list: task_res_list.into_iter().map(task_res_to_proto).collect(),
        }))
    }

    async fn get_nodes(
        &self,
        request: Request<GetNodesRequest>,
    ) -> Result<Response<GetNodesResponse>, Status> {
        let run_id = sint64_to_uint64(request.into_inner().run_id);
        let nodes = self.state.get_nodes(run_id).await.map_err(state_err)?;
        Ok(Response::new(GetNodesResponse {
            nodes: nodes
                .into_iter()
                .map(|node_id| proto::NodeRef {
                    node_id: uint64_to_sint64(node_id),
                    anonymous: false,
                })
                .collect(),
        }))
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
}
