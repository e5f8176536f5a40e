use tonic::Status;

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::task::{ConfigValue, NodeRef, Run, Task, TaskIns, TaskRes};

pub mod proto {
    tonic::include_proto!("fedlink.v1");
}

// --- Proto ↔ core conversions ---

pub fn node_ref_from_proto(node: Option<proto::NodeRef>) -> NodeRef {
    let node = node.unwrap_or_default();
    NodeRef {
        node_id: sint64_to_uint64(node.node_id),
        anonymous: node.anonymous,
    }
}

pub fn node_ref_to_proto(node: &NodeRef) -> proto::NodeRef {
    proto::NodeRef {
        node_id: uint64_to_sint64(node.node_id),
        anonymous: node.anonymous,
    }
}

fn task_from_proto(task: Option<proto::Task>) -> Task {
    let task = task.unwrap_or_default();
    Task {
        producer: node_ref_from_proto(task.producer),
        consumer: node_ref_from_proto(task.consumer),
        created_at: task.created_at,
        delivered_at: task.delivered_at,
        pushed_at: task.pushed_at,
        ttl: task.ttl,
        ancestry: task.ancestry,
        task_type: task.task_type,
        recordset: task.recordset.map(|r| r.payload).unwrap_or_default(),
    }
}

fn task_to_proto(task: Task) -> proto::Task {
    proto::Task {
        producer: Some(node_ref_to_proto(&task.producer)),
        consumer: Some(node_ref_to_proto(&task.consumer)),
        created_at: task.created_at,
        delivered_at: task.delivered_at,
        pushed_at: task.pushed_at,
        ttl: task.ttl,
        ancestry: task.ancestry,
        task_type: task.task_type,
        recordset: Some(proto::RecordSet {
            payload: task.recordset,
        }),
    }
}

pub fn task_ins_from_proto(ins: proto::TaskIns) -> TaskIns {
    TaskIns {
        task_id: ins.task_id,
        group_id: ins.group_id,
        run_id: sint64_to_uint64(ins.run_id),
        task: task_from_proto(ins.task),
    }
}

pub fn task_ins_to_proto(ins: TaskIns) -> proto::TaskIns {
    proto::TaskIns {
        task_id: ins.task_id,
        group_id: ins.group_id,
        run_id: uint64_to_sint64(ins.run_id),
        task: Some(task_to_proto(ins.task)),
    }
}

pub fn task_res_from_proto(res: proto::TaskRes) -> TaskRes {
    TaskRes {
        task_id: res.task_id,
        group_id: res.group_id,
        run_id: sint64_to_uint64(res.run_id),
        task: task_from_proto(res.task),
    }
}

pub fn task_res_to_proto(res: TaskRes) -> proto::TaskRes {
    proto::TaskRes {
        task_id: res.task_id,
        group_id: res.group_id,
        run_id: uint64_to_sint64(res.run_id),
        task: Some(task_to_proto(res.task)),
    }
}

pub fn config_value_from_proto(value: proto::ConfigValue) -> ConfigValue {
    match value.kind {
        Some(proto::config_value::Kind::BoolValue(b)) => ConfigValue::Bool(b),
        Some(proto::config_value::Kind::IntValue(i)) => ConfigValue::Int(i),
        Some(proto::config_value::Kind::DoubleValue(d)) => ConfigValue::Double(d),
        Some(proto::config_value::Kind::StringValue(s)) => ConfigValue::Str(s),
        None => ConfigValue::Bool(false),
    }
}

pub fn config_value_to_proto(value: ConfigValue) -> proto::ConfigValue {
    let kind = match value {
        ConfigValue::Bool(b) => proto::config_value::Kind::BoolValue(b),
        ConfigValue::Int(i) => proto::config_value::Kind::IntValue(i),
        ConfigValue::Double(d) => proto::config_value::Kind::DoubleValue(d),
        ConfigValue::Str(s) => proto::config_value::Kind::StringValue(s),
    };
    proto::ConfigValue { kind: Some(kind) }
}

pub fn run_to_proto(run: Run) -> proto::Run {
    proto::Run {
        run_id: uint64_to_sint64(run.run_id),
        fab_id: run.fab_id,
        fab_version: run.fab_version,
        fab_hash: run.fab_hash,
        override_config: run
            .override_config
            .into_iter()
            .map(|(k, v)| (k, config_value_to_proto(v)))
            .collect(),
    }
}

pub fn run_from_proto(run: proto::Run) -> Run {
    Run {
        run_id: sint64_to_uint64(run.run_id),
        fab_id: run.fab_id,
        fab_version: run.fab_version,
        fab_hash: run.fab_hash,
        override_config: run
            .override_config
            .into_iter()
            .map(|(k, v)| (k, config_value_from_proto(v)))
            .collect(),
    }
}

pub fn state_err(err: anyhow::Error) -> Status {
    Status::internal(format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ins_proto_round_trip() {
        let ins = TaskIns {
            task_id: "t-1".to_string(),
            group_id: "g".to_string(),
            run_id: u64::MAX,
            task: Task {
                producer: NodeRef {
                    node_id: 0,
                    anonymous: true,
                },
                consumer: NodeRef {
                    node_id: (i64::MAX as u64) + 7,
                    anonymous: false,
                },
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
                delivered_at: String::new(),
                pushed_at: 1.5,
                ttl: 60.0,
                ancestry: vec!["parent".to_string()],
                task_type: "evaluate".to_string(),
                recordset: vec![1, 2, 3],
            },
        };

        let round = task_ins_from_proto(task_ins_to_proto(ins.clone()));
        assert_eq!(round, ins);
    }

    #[test]
    fn test_run_proto_round_trip() {
        let mut run = Run {
            run_id: (i64::MAX as u64) + 1,
            fab_id: "app".to_string(),
            fab_version: "0.3.0".to_string(),
            fab_hash: String::new(),
            override_config: Default::default(),
        };
        run.override_config
            .insert("rounds".to_string(), ConfigValue::Int(10));
        run.override_config
            .insert("fraction".to_string(), ConfigValue::Double(0.5));

        let round = run_from_proto(run_to_proto(run.clone()));
        assert_eq!(round, run);
    }
}
