use keyflag_core::{Decision, UserId};

use super::{record_line, record_table, Context};

pub fn propose(
    ctx: &Context,
    key: &str,
    value: &str,
    value_type: &str,
    user: UserId,
) -> anyhow::Result<()> {
    let record = ctx.engine.propose_update(key, value, value_type, user)?;
    ctx.emit(&record, |r| format!("✓ Proposed {} (record {})", r.key, r.id))
}

pub fn propose_delete(ctx: &Context, key: &str, value_type: &str, user: UserId) -> anyhow::Result<()> {
    let record = ctx.engine.propose_delete(key, "", value_type, user)?;
    ctx.emit(&record, |r| {
        format!("✓ Proposed delete of {} (record {})", r.key, r.id)
    })
}

pub fn approve(ctx: &Context, key: &str, user: UserId, decision: Decision) -> anyhow::Result<()> {
    let outcome = ctx.engine.approve(key, user, decision)?;
    ctx.emit(&outcome, |o| {
        let mut line = format!("✓ {} {}\n{}", o.decision, o.record.key, record_line(&o.record));
        if !o.cache_synced {
            line.push_str("\n! cache not updated, reads fall back to the store");
        }
        line
    })
}

pub fn approve_delete(
    ctx: &Context,
    key: &str,
    user: UserId,
    decision: Decision,
) -> anyhow::Result<()> {
    let outcome = ctx.engine.approve_delete(key, user, decision)?;
    ctx.emit(&outcome, |o| {
        format!("✓ {} delete of {}\n{}", o.decision, o.record.key, record_line(&o.record))
    })
}

pub fn retire(ctx: &Context, record_id: u64, user: UserId) -> anyhow::Result<()> {
    let outcome = ctx.engine.retire_key(record_id, user)?;
    ctx.emit(&outcome, |o| format!("✓ Retired record {} ({})", o.record.id, o.record.key))
}

pub fn get(ctx: &Context, key: &str) -> anyhow::Result<()> {
    let record = ctx.engine.get_active_value(key)?;
    ctx.emit(&record, |r| r.value.clone())
}

pub fn list(ctx: &Context, prefix: &str, host: &str) -> anyhow::Result<()> {
    let records = ctx.engine.get_active_values(prefix, host)?;
    ctx.emit(&records, |r| record_table(r))
}

pub fn pending(ctx: &Context, prefix: &str, all: bool) -> anyhow::Result<()> {
    let records = if all {
        ctx.engine.list_all_pending_approvals(prefix)?
    } else {
        ctx.engine.list_pending_approvals(prefix)?
    };
    ctx.emit(&records, |r| record_table(r))
}

pub fn history(ctx: &Context, key: &str, is_prefix: bool, limit: Option<usize>) -> anyhow::Result<()> {
    let records = ctx.engine.history(key, is_prefix, limit)?;
    ctx.emit(&records, |r| record_table(r))
}

pub fn browse(ctx: &Context, prefix: &str) -> anyhow::Result<()> {
    let keys = ctx.engine.browse_keys(prefix)?;
    ctx.emit(&keys, |k| k.join("\n"))
}
