use crate::proto;
use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};
use fedlink_core::task::{now_epoch, now_rfc3339, ConfigValue, Run};

/// Routing and identity facts of an application message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub run_id: u64,
    pub message_id: String,
    pub src_node_id: u64,
    pub dst_node_id: u64,
    /// Id of the message this one answers; "" for an instruction.
    pub reply_to_message: String,
    pub group_id: String,
    pub ttl: f64,
    pub message_type: String,
}

/// The unit the workload consumes and produces. The content is the
/// opaque recordset payload; this crate never looks inside.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub metadata: Metadata,
    pub content: Vec<u8>,
}

impl Message {
    /// Build the reply to this message: addresses swapped, ancestry
    /// pointing back at it.
    pub fn create_reply(&self, content: Vec<u8>) -> Message {
        Message {
            metadata: Metadata {
                run_id: self.metadata.run_id,
                message_id: String::new(),
                src_node_id: self.metadata.dst_node_id,
                dst_node_id: self.metadata.src_node_id,
                reply_to_message: self.metadata.message_id.clone(),
                group_id: self.metadata.group_id.clone(),
                ttl: self.metadata.ttl,
                message_type: self.metadata.message_type.clone(),
            },
            content,
        }
    }
}

/// Decode a pulled instruction into the application message. The wire
/// task id becomes the message id.
pub fn message_from_task_ins(ins: proto::TaskIns) -> Message {
    let task = ins.task.unwrap_or_default();
    let producer = task.producer.unwrap_or_default();
    let consumer = task.consumer.unwrap_or_default();
    Message {
        metadata: Metadata {
            run_id: sint64_to_uint64(ins.run_id),
            message_id: ins.task_id,
            src_node_id: sint64_to_uint64(producer.node_id),
            dst_node_id: sint64_to_uint64(consumer.node_id),
            reply_to_message: String::new(),
            group_id: ins.group_id,
            ttl: task.ttl,
            message_type: task.task_type,
        },
        content: task.recordset.map(|r| r.payload).unwrap_or_default(),
    }
}

/// Encode an outgoing reply as a wire task result, stamping the push
/// instants. Ancestry is exactly the answered message id.
pub fn task_res_from_message(message: &Message) -> proto::TaskRes {
    proto::TaskRes {
        task_id: String::new(),
        group_id: message.metadata.group_id.clone(),
        run_id: uint64_to_sint64(message.metadata.run_id),
        task: Some(proto::Task {
            producer: Some(proto::NodeRef {
                node_id: uint64_to_sint64(message.metadata.src_node_id),
                anonymous: message.metadata.src_node_id == 0,
            }),
            consumer: Some(proto::NodeRef {
                node_id: uint64_to_sint64(message.metadata.dst_node_id),
                anonymous: message.metadata.dst_node_id == 0,
            }),
            created_at: now_rfc3339(),
            delivered_at: String::new(),
            pushed_at: now_epoch(),
            ttl: message.metadata.ttl,
            ancestry: vec![message.metadata.reply_to_message.clone()],
            task_type: message.metadata.message_type.clone(),
            recordset: Some(proto::RecordSet {
                payload: message.content.clone(),
            }),
        }),
    }
}

fn config_value_from_proto(value: proto::ConfigValue) -> ConfigValue {
    match value.kind {
        Some(proto::config_value::Kind::BoolValue(b)) => ConfigValue::Bool(b),
        Some(proto::config_value::Kind::IntValue(i)) => ConfigValue::Int(i),
        Some(proto::config_value::Kind::DoubleValue(d)) => ConfigValue::Double(d),
        Some(proto::config_value::Kind::StringValue(s)) => ConfigValue::Str(s),
        None => ConfigValue::Bool(false),
    }
}

/// Decode a wire run into the core type.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_ins() -> proto::TaskIns {
        proto::TaskIns {
            task_id: "ins-123".to_string(),
            group_id: "round-4".to_string(),
            run_id: uint64_to_sint64(u64::MAX),
            task: Some(proto::Task {
                producer: Some(proto::NodeRef {
                    node_id: 0,
                    anonymous: true,
                }),
                consumer: Some(proto::NodeRef {
                    node_id: uint64_to_sint64(77),
                    anonymous: false,
                }),
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
                delivered_at: String::new(),
                pushed_at: 10.0,
                ttl: 600.0,
                ancestry: Vec::new(),
                task_type: "train".to_string(),
                recordset: Some(proto::RecordSet {
                    payload: b"parameters".to_vec(),
                }),
            }),
        }
    }

    #[test]
    fn test_message_from_task_ins() {
        let message = message_from_task_ins(wire_ins());
        assert_eq!(message.metadata.run_id, u64::MAX);
        assert_eq!(message.metadata.message_id, "ins-123");
        assert_eq!(message.metadata.src_node_id, 0);
        assert_eq!(message.metadata.dst_node_id, 77);
        assert_eq!(message.metadata.message_type, "train");
        assert_eq!(message.content, b"parameters");
    }

    #[test]
    fn test_reply_carries_ancestry_link() {
        let message = message_from_task_ins(wire_ins());
        let reply = message.create_reply(b"update".to_vec());
        assert_eq!(reply.metadata.reply_to_message, "ins-123");
        assert_eq!(reply.metadata.src_node_id, 77);
        assert_eq!(reply.metadata.dst_node_id, 0);

        let task_res = task_res_from_message(&reply);
        assert_eq!(sint64_to_uint64(task_res.run_id), u64::MAX);
        let task = task_res.task.unwrap();
        assert_eq!(task.ancestry, vec!["ins-123".to_string()]);
        assert!(task.consumer.unwrap().anonymous);
        assert!(!task.created_at.is_empty());
        assert!(task.delivered_at.is_empty());
        assert_eq!(task.recordset.unwrap().payload, b"update");
    }

    #[test]
    fn test_run_from_proto_decodes_config() {
        let mut run = proto::Run {
            run_id: 5,
            fab_id: "app".to_string(),
            fab_version: "1.0".to_string(),
            fab_hash: String::new(),
            override_config: Default::default(),
        };
        run.override_config.insert(
            "lr".to_string(),
            proto::ConfigValue {
                kind: Some(proto::config_value::Kind::DoubleValue(0.1)),
            },
        );

        let run = run_from_proto(run);
        assert_eq!(run.run_id, 5);
        assert_eq!(
            run.override_config.get("lr"),
            Some(&ConfigValue::Double(0.1))
        );
    }
}
