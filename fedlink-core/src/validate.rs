use crate::task::{NodeRef, Task, TaskIns, TaskRes};

/// Structural checks on an inbound instruction. A non-empty return
/// aborts the store insert; the caller gets no id back.
pub fn validate_task_ins(ins: &TaskIns) -> Vec<String> {
    let mut errors = Vec::new();
    check_task(&mut errors, ins.run_id, &ins.task);
    errors
}

/// Structural checks on an inbound result.
pub fn validate_task_res(res: &TaskRes) -> Vec<String> {
    let mut errors = Vec::new();
    check_task(&mut errors, res.run_id, &res.task);
    if res.task.ancestry.len() != 1 {
        errors.push("`ancestry` of a reply must name exactly one task".to_string());
    }
    errors
}

fn check_task(errors: &mut Vec<String>, run_id: u64, task: &Task) {
    if run_id == 0 {
        errors.push("`run_id` must not be zero".to_string());
    }
    check_addressing(errors, "producer", &task.producer);
    check_addressing(errors, "consumer", &task.consumer);
    if task.ttl <= 0.0 {
        errors.push("`ttl` must be greater than zero".to_string());
    }
    if task.task_type.is_empty() {
        errors.push("`task_type` must not be empty".to_string());
    }
    if task.recordset.is_empty() {
        errors.push("`recordset` must be present".to_string());
    }
    if !task.delivered_at.is_empty() {
        errors.push("`delivered_at` must be unset on push".to_string());
    }
}

fn check_addressing(errors: &mut Vec<String>, role: &str, node: &NodeRef) {
    if node.anonymous && node.node_id != 0 {
        errors.push(format!(
            "`{role}` is anonymous but carries node id {}",
            node.node_id
        ));
    }
    if !node.anonymous && node.node_id == 0 {
        errors.push(format!("`{role}` is not anonymous but has no node id"));
    }
}
