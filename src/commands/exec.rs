//! Interactive entry points into running containers.

use super::{finish, Context};
use crate::cli::{AttachArgs, ExecArgs};
use crate::error::{Error, Result};
use crate::session::{run_container_session, run_exec_session, ExecRequest, SessionOptions};

pub async fn exec(ctx: &Context, args: &ExecArgs) -> Result<()> {
    let keys = ctx.detach_keys(args.detach_keys.as_deref())?;
    let target = ctx.target(&args.container, args.agent);
    let container = ctx.inspect(&target).await?;

    let request = ExecRequest {
        cmd: args.cmd.clone(),
        env: args.env.clone(),
        workdir: args.workdir.clone(),
        user: args.user.clone(),
        privileged: args.privileged,
        tty: args.tty,
        interactive: args.interactive,
        detach: args.detach,
    };
    let options = SessionOptions {
        tty: args.tty,
        stdin_open: args.interactive,
        detach_keys: Some(keys),
        ..SessionOptions::default()
    };
    let outcome = run_exec_session(
        ctx.engine.as_ref(),
        &ctx.terminal,
        &container,
        &request,
        &options,
        ctx.io(),
        &ctx.cancel,
    )
    .await?;
    finish(outcome)
}

/// Attach to a running container. The container keeps running after a
/// detach.
pub async fn attach(ctx: &Context, args: &AttachArgs) -> Result<()> {
    let keys = ctx.detach_keys(args.detach_keys.as_deref())?;
    let target = ctx.target(&args.container, args.agent);
    let container = ctx.inspect(&target).await?;
    if !container.is_running() {
        return Err(Error::ContainerNotRunning(container.name));
    }

    let options = SessionOptions {
        tty: container.tty,
        stdin_open: !args.no_stdin,
        auto_remove: false,
        start: false,
        detach_keys: Some(keys),
        ..SessionOptions::default()
    };
    let outcome = run_container_session(
        ctx.engine.as_ref(),
        &ctx.terminal,
        &container,
        &options,
        ctx.io(),
        &ctx.cancel,
    )
    .await?;
    finish(outcome)
}
