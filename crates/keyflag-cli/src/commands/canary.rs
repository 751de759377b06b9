use keyflag_core::{Decision, UserId};

use super::{record_line, Context};

pub fn start(
    ctx: &Context,
    key: &str,
    user: UserId,
    decision: Decision,
    hosts: &[String],
) -> anyhow::Result<()> {
    let outcome = ctx.engine.start_or_extend_canary(key, user, decision, hosts)?;
    ctx.emit(&outcome, |o| {
        if decision == Decision::Reject {
            return format!("✓ Canary aborted\n{}", record_line(&o.record));
        }
        let verb = if o.first_time { "Started" } else { "Extended" };
        let added = if o.added_hosts.is_empty() {
            "no new hosts".to_string()
        } else {
            o.added_hosts.join(", ")
        };
        format!("✓ {verb} canary for {} (record {}): {added}", o.record.key, o.record.id)
    })
}

pub fn status(ctx: &Context, record_id: u64) -> anyhow::Result<()> {
    let status = ctx.engine.canary_status(record_id)?;
    ctx.emit(&status, |s| {
        format!(
            "{} (record {})\n  enabled:     {}\n  recommended: {}",
            s.key,
            s.record_id,
            s.enabled_hosts.join(", "),
            s.recommended_hosts.join(", ")
        )
    })
}

pub fn register(ctx: &Context, service: &str, hosts: &[String]) -> anyhow::Result<()> {
    ctx.engine.register_canary_deployment(service, hosts)?;
    ctx.emit(&hosts, |h| format!("✓ Registered {} hosts for {service}", h.len()))
}

pub fn release(ctx: &Context, service: &str) -> anyhow::Result<()> {
    ctx.engine.release_canary_hosts(service)?;
    ctx.emit(&service, |s| format!("✓ Released canary hosts of {s}"))
}
