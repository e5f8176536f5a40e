use std::sync::{Arc, Mutex};

use tonic::{Request, Response, Status};

use fedlink_core::id::generate_id;

use crate::proto;
use crate::proto::client_app_io_server::{ClientAppIo, ClientAppIoServer};

/// Status code reported to the workload on a successful push.
pub const APPIO_STATUS_SUCCESS: u32 = 0;

/// Default listen address of the workload-facing servicer.
pub const APPIO_DEFAULT_ADDRESS: &str = "0.0.0.0:9094";

/// One message exchange with the workload process.
#[derive(Default)]
struct Session {
    token: Option<u64>,
    message: Option<proto::Message>,
    context: Option<proto::Context>,
    run: Option<proto::Run>,
    out_message: Option<proto::Message>,
    out_context: Option<proto::Context>,
}

/// Workload-facing servicer. One session per instance: the hosting
/// node process arms it with `set_inputs` (minting a fresh token the
/// workload must present), the workload pulls its inputs and pushes
/// its outputs, and the node collects them with `take_outputs`.
/// Clones share the session, so the host keeps a handle while tonic
/// owns the serving copy.
#[derive(Clone, Default)]
pub struct ClientAppIoService {
    session: Arc<Mutex<Session>>,
}

impl ClientAppIoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve this instance for the workload process until the task is
    /// cancelled or the transport fails.
    pub async fn serve(
        &self,
        addr: std::net::SocketAddr,
    ) -> Result<(), tonic::transport::Error> {
        tonic::transport::Server::builder()
            .add_service(ClientAppIoServer::new(self.clone()))
            .serve(addr)
            .await
    }

    /// Arm the session for one exchange and mint its token.
    pub fn set_inputs(
        &self,
        message: proto::Message,
        context: proto::Context,
        run: proto::Run,
    ) -> u64 {
        let token = generate_id();
        let mut session = self.session.lock().unwrap();
        *session = Session {
            token: Some(token),
            message: Some(message),
            context: Some(context),
            run: Some(run),
            out_message: None,
            out_context: None,
        };
        token
    }

    /// Collect what the workload pushed back, disarming the session.
    /// `None` when the workload never pushed.
    pub fn take_outputs(&self) -> Option<(proto::Message, proto::Context)> {
        let mut session = self.session.lock().unwrap();
        let outputs = session.out_message.take().zip(session.out_context.take());
        *session = Session::default();
        outputs
    }
}

#[tonic::async_trait]
impl ClientAppIo for ClientAppIoService {
    async fn pull_client_app_inputs(
        &self,
        request: Request<proto::PullClientAppInputsRequest>,
    ) -> Result<Response<proto::PullClientAppInputsResponse>, Status> {
        let token = request.into_inner().token;
        let session = self.session.lock().unwrap();
        if session.token != Some(token) {
            return Err(Status::permission_denied(
                "token does not match the armed session",
            ));
        }
        Ok(Response::new(proto::PullClientAppInputsResponse {
            message: session.message.clone(),
            context: session.context.clone(),
            run: session.run.clone(),
        }))
    }

    async fn push_client_app_outputs(
        &self,
        request: Request<proto::PushClientAppOutputsRequest>,
    ) -> Result<Response<proto::PushClientAppOutputsResponse>, Status> {
        let req = request.into_inner();
        let mut session = self.session.lock().unwrap();
        if session.token != Some(req.token) {
            return Err(Status::permission_denied(
                "token does not match the armed session",
            ));
        }
        session.out_message = req.message;
        session.out_context = req.context;
        Ok(Response::new(proto::PushClientAppOutputsResponse {
            status: APPIO_STATUS_SUCCESS,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> (proto::Message, proto::Context, proto::Run) {
        let message = proto::Message {
            metadata: Some(proto::Metadata {
                run_id: 3,
                message_id: "m-1".to_string(),
                src_node_id: 0,
                dst_node_id: 9,
                reply_to_message: String::new(),
                group_id: "g".to_string(),
                ttl: 60.0,
                message_type: "train".to_string(),
            }),
            content: Some(proto::RecordSet {
                payload: b"weights".to_vec(),
            }),
        };
        let context = proto::Context {
            state: b"ctx".to_vec(),
        };
        let run = proto::Run {
            run_id: 3,
            ..Default::default()
        };
        (message, context, run)
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let service = ClientAppIoService::new();
        let (message, context, run) = inputs();
        let token = service.set_inputs(message.clone(), context.clone(), run);

        let pulled = service
            .pull_client_app_inputs(Request::new(proto::PullClientAppInputsRequest { token }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(pulled.message, Some(message.clone()));
        assert_eq!(pulled.context, Some(context));
        assert_eq!(pulled.run.unwrap().run_id, 3);

        let status = service
            .push_client_app_outputs(Request::new(proto::PushClientAppOutputsRequest {
                token,
                message: Some(message.clone()),
                context: Some(proto::Context {
                    state: b"ctx2".to_vec(),
                }),
            }))
            .await
            .unwrap()
            .into_inner()
            .status;
        assert_eq!(status, APPIO_STATUS_SUCCESS);

        let (out_message, out_context) = service.take_outputs().unwrap();
        assert_eq!(out_message, message);
        assert_eq!(out_context.state, b"ctx2");

        // The session is disarmed after collection.
        assert!(service.take_outputs().is_none());
    }

    #[tokio::test]
    async fn test_mismatched_token_rejected() {
        let service = ClientAppIoService::new();
        let (message, context, run) = inputs();
        let token = service.set_inputs(message, context, run);

        let status = service
            .pull_client_app_inputs(Request::new(proto::PullClientAppInputsRequest {
                token: token.wrapping_add(1),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status = service
            .push_client_app_outputs(Request::new(proto::PushClientAppOutputsRequest {
                token: token.wrapping_add(1),
                message: None,
                context: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_rearming_rotates_token() {
        let service = ClientAppIoService::new();
        let (message, context, run) = inputs();
        let first = service.set_inputs(message.clone(), context.clone(), run.clone());
        let second = service.set_inputs(message, context, run);
        assert_ne!(first, second);

        let status = service
            .pull_client_app_inputs(Request::new(proto::PullClientAppInputsRequest {
                token: first,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }
}
