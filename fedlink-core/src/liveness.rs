use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{now_epoch, now_rfc3339, Task, TaskIns, TaskRes};

/// Task type stamped on substitute replies.
pub const TASK_TYPE_ERROR: &str = "error";

pub const ERROR_CODE_UNKNOWN: u32 = 0;
pub const ERROR_CODE_NODE_UNAVAILABLE: u32 = 1;

const NODE_UNAVAILABLE_REASON: &str =
    "the consumer node is past its online horizon and presumed offline";

/// In-band error payload carried by a substitute reply's recordset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: u32,
    pub reason: String,
}

/// Horizon after which a node counts as offline absent a fresh ping.
pub fn online_until(now: f64, ping_interval: f64) -> f64 {
    now + ping_interval
}

pub fn is_offline(online_until: f64, now: f64) -> bool {
    online_until < now
}

/// Synthesize the reply delivered in place of an answer from a dead
/// node. Never persisted; ancestry points at the unanswered
/// instruction so the driver matches it like any real reply.
pub fn node_unavailable_res(ins: &TaskIns) -> TaskRes {
    let error = TaskError {
        code: ERROR_CODE_NODE_UNAVAILABLE,
        reason: NODE_UNAVAILABLE_REASON.to_string(),
    };
    TaskRes {
        task_id: Uuid::new_v4().to_string(),
        group_id: ins.group_id.clone(),
        run_id: ins.run_id,
        task: Task {
            producer: ins.task.consumer.clone(),
            consumer: ins.task.producer.clone(),
            created_at: now_rfc3339(),
            delivered_at: now_rfc3339(),
            pushed_at: now_epoch(),
            ttl: ins.task.ttl,
            ancestry: vec![ins.task_id.clone()],
            task_type: TASK_TYPE_ERROR.to_string(),
            recordset: serde_json::to_vec(&error).unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NodeRef;

    #[test]
    fn test_online_horizon() {
        assert_eq!(online_until(100.0, 30.0), 130.0);
        assert!(is_offline(99.0, 100.0));
        assert!(!is_offline(101.0, 100.0));
        assert!(!is_offline(100.0, 100.0));
    }

    #[test]
    fn test_substitute_links_back_to_instruction() {
        let ins = TaskIns {
            task_id: "ins-1".to_string(),
            group_id: "g".to_string(),
            run_id: 9,
            task: Task {
                producer: NodeRef {
                    node_id: 0,
                    anonymous: true,
                },
                consumer: NodeRef {
                    node_id: 11,
                    anonymous: false,
                },
                ttl: 60.0,
                task_type: "train".to_string(),
                recordset: b"x".to_vec(),
                ..Task::default()
            },
        };

        let res = node_unavailable_res(&ins);
        assert_eq!(res.run_id, 9);
        assert_eq!(res.task.ancestry, vec!["ins-1".to_string()]);
        assert_eq!(res.task.task_type, TASK_TYPE_ERROR);
        assert_eq!(res.task.producer.node_id, 11);

        let error: TaskError = serde_json::from_slice(&res.task.recordset).unwrap();
        assert_eq!(error.code, ERROR_CODE_NODE_UNAVAILABLE);
        assert!(!error.reason.is_empty());
    }
}
