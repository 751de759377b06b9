use super::Context;

pub fn bootstrap(ctx: &Context, username: &str, tribe: &str, service: &str) -> anyhow::Result<()> {
    let boot = ctx.engine.bootstrap_service(username, tribe, service)?;
    ctx.emit(&boot, |b| {
        let roles: Vec<_> = b.roles.iter().map(|r| r.permission.as_str()).collect();
        format!(
            "✓ Bootstrapped {tribe}/{service}\n  default: {} = {}\n  roles:   {}\n  lead:    {}",
            b.record.key,
            b.record.value,
            roles.join(", "),
            b.user.username
        )
    })
}

pub fn add_user(ctx: &Context, username: &str, email: &str) -> anyhow::Result<()> {
    let user = ctx.engine.create_user(username, email)?;
    ctx.emit(&user, |u| format!("✓ User {} (id {})", u.username, u.id))
}

pub fn show_user(ctx: &Context, username: &str) -> anyhow::Result<()> {
    let user = ctx.engine.user_by_name(username)?;
    let roles = ctx.engine.store().roles_for_user(user.id)?;
    ctx.emit(&(user, roles), |(u, r)| {
        let grants: Vec<_> = r
            .iter()
            .map(|role| format!("{} on {}", role.permission.as_str(), role.prefix))
            .collect();
        format!("{} (id {}) {}\n  {}", u.username, u.id, u.email, grants.join("\n  "))
    })
}
