//! 在候选算子中选择。

use super::{AttentionBwOp, AttentionFwOp, Inputs};
use crate::{unsupported, LaunchError};
use log::debug;

/// `ops` 中第一个接受 `inp` 的算子。
pub fn select_fw<'a>(
    ops: &[&'a dyn AttentionFwOp],
    inp: &Inputs,
) -> Result<&'a dyn AttentionFwOp, LaunchError> {
    select(ops, inp, |op| op.not_supported_reasons(inp), |op| op.name())
}

pub fn select_bw<'a>(
    ops: &[&'a dyn AttentionBwOp],
    inp: &Inputs,
) -> Result<&'a dyn AttentionBwOp, LaunchError> {
    select(ops, inp, |op| op.not_supported_reasons(inp), |op| op.name())
}

fn select<'a, T: ?Sized>(
    ops: &[&'a T],
    inp: &Inputs,
    reasons_of: impl Fn(&T) -> Vec<String>,
    name_of: impl Fn(&T) -> &str,
) -> Result<&'a T, LaunchError> {
    let mut reasons = Vec::new();
    for &op in ops {
        let refused = reasons_of(op);
        if refused.is_empty() {
            debug!("selected {} for {:?}", name_of(op), inp.query.shape());
            return Ok(op);
        }
        reasons.extend(refused.into_iter().map(|r| format!("{}: {r}", name_of(op))));
    }
    if reasons.is_empty() {
        reasons.push("no operator to choose from".into());
    }
    Err(unsupported("memory-efficient attention", reasons))
}
