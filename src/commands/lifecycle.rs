//! Container lifecycle: run, create, start, stop and friends.

use super::{finish, print, Bulk, Context};
use crate::cli::{
    CreateArgs, KillArgs, RenameArgs, RmArgs, RmiArgs, RunArgs, StartArgs, StopArgs, TargetsArgs,
};
use crate::engine::{
    ContainerRef, ContainerState, CreateContainerRequest, EngineError, HostConfig, RestartPolicy,
    WaitCondition,
};
use crate::error::{Error, Result};
use crate::names::{
    generate_agent_name, resolve_container_name, resolve_image, validate_agent_name, LABEL_AGENT,
    LABEL_MANAGED, LABEL_PROJECT,
};
use crate::session::{run_container_session, SessionOptions};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tracing::{debug, info, warn};

/// Parse a `--restart` value: `no`, `always`, `unless-stopped`,
/// `on-failure` or `on-failure:N`.
pub fn parse_restart_policy(value: &str) -> Result<RestartPolicy> {
    let invalid = || Error::InvalidArgument(format!("invalid restart policy {value:?}"));
    let (name, count) = match value.split_once(':') {
        Some((name, count)) => (name, Some(count)),
        None => (value, None),
    };
    match (name, count) {
        ("no" | "always" | "unless-stopped", None) => Ok(RestartPolicy {
            name: name.to_string(),
            maximum_retry_count: None,
        }),
        ("on-failure", count) => {
            let maximum_retry_count = count
                .map(|c| c.parse::<i64>().map_err(|_| invalid()))
                .transpose()?;
            Ok(RestartPolicy {
                name: name.to_string(),
                maximum_retry_count,
            })
        }
        _ => Err(invalid()),
    }
}

/// Flag checks that need no engine.
fn validate(args: &CreateArgs) -> Result<Option<RestartPolicy>> {
    let policy = args.restart.as_deref().map(parse_restart_policy).transpose()?;
    if args.rm && policy.as_ref().is_some_and(|p| p.name != "no") {
        return Err(Error::InvalidArgument(
            "conflicting options: --restart and --rm".to_string(),
        ));
    }
    if args.memory_swap.is_some() && args.memory.is_none() {
        return Err(Error::InvalidArgument(
            "--memory-swap requires --memory".to_string(),
        ));
    }
    if let Some(agent) = &args.agent {
        validate_agent_name(agent)?;
    }
    Ok(policy)
}

fn parse_labels(labels: &[String]) -> HashMap<String, String> {
    labels
        .iter()
        .map(|label| match label.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (label.clone(), String::new()),
        })
        .collect()
}

/// Agent names already used in the project.
async fn taken_agents(ctx: &Context) -> Result<HashSet<String>> {
    let filter = ctx.project_filter();
    let containers = ctx
        .call(
            || "listing project containers".to_string(),
            ctx.engine.list_containers(true, &filter),
        )
        .await?;
    Ok(containers
        .into_iter()
        .filter_map(|c| c.labels.get(LABEL_AGENT).cloned())
        .collect())
}

/// Shared by `run` and `create`: resolve image and names, then create.
async fn create_container(
    ctx: &Context,
    args: &CreateArgs,
    policy: Option<RestartPolicy>,
    attach: bool,
) -> Result<ContainerRef> {
    let config = &ctx.config;
    let image = ctx
        .cancellable(resolve_image(
            &args.image,
            ctx.engine.as_ref(),
            &config.project,
            &config.settings,
        ))
        .await?;

    let agent = match &args.agent {
        Some(agent) => agent.clone(),
        None => generate_agent_name(&taken_agents(ctx).await?),
    };
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| resolve_container_name(ctx.project_key(), &agent));

    let mut labels = parse_labels(&args.label);
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_PROJECT.to_string(), ctx.project_key().to_string());
    labels.insert(LABEL_AGENT.to_string(), agent.clone());

    let workspace = config.project.workspace_bind();
    let working_dir = args.workdir.clone().or_else(|| {
        workspace
            .as_ref()
            .map(|_| config.project.config.workspace.target.clone())
    });
    let binds = workspace.into_iter().chain(args.volume.iter().cloned()).collect();

    let request = CreateContainerRequest {
        image,
        cmd: args.cmd.clone(),
        entrypoint: args.entrypoint.as_ref().map(|e| {
            if e.is_empty() {
                Vec::new()
            } else {
                vec![e.clone()]
            }
        }),
        env: args.env.clone(),
        working_dir,
        user: args.user.clone(),
        labels,
        tty: args.tty,
        open_stdin: args.interactive,
        stdin_once: attach && args.interactive,
        attach_stdin: attach && args.interactive,
        attach_stdout: attach,
        attach_stderr: attach,
        host_config: HostConfig {
            binds,
            auto_remove: args.rm,
            privileged: args.privileged,
            memory: args.memory,
            memory_swap: args.memory_swap,
            restart_policy: policy,
        },
    };

    let response = ctx
        .call(
            || format!("creating container {name}"),
            ctx.engine.create_container(Some(&name), &request),
        )
        .await?;
    for warning in response.warnings.iter().flatten() {
        warn!("{warning}");
    }
    info!(id = %response.id, %name, %agent, image = %request.image, "created container");

    Ok(ContainerRef {
        id: response.id,
        name,
        state: ContainerState::Created,
        tty: args.tty,
    })
}

pub async fn run(ctx: &Context, args: &RunArgs) -> Result<()> {
    let policy = validate(&args.create)?;
    let keys = ctx.detach_keys(args.detach_keys.as_deref())?;
    let container = create_container(ctx, &args.create, policy, !args.detach).await?;

    if args.detach {
        ctx.call(
            || format!("starting container {}", container.name),
            ctx.engine.start_container(&container.id),
        )
        .await?;
        let mut io = ctx.io();
        return print(&mut io, &format!("{}\n", container.id)).await;
    }

    let options = SessionOptions {
        tty: args.create.tty,
        stdin_open: args.create.interactive,
        auto_remove: args.create.rm,
        start: true,
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

pub async fn create(ctx: &Context, args: &CreateArgs) -> Result<()> {
    let policy = validate(args)?;
    let container = create_container(ctx, args, policy, false).await?;
    let mut io = ctx.io();
    print(&mut io, &format!("{}\n", container.id)).await
}

pub async fn start(ctx: &Context, args: &StartArgs) -> Result<()> {
    let targets = ctx.targets(&args.targets.containers, args.targets.agent);

    if args.attach || args.interactive {
        let [target] = targets.as_slice() else {
            return Err(Error::InvalidArgument(
                "you cannot start and attach multiple containers at once".to_string(),
            ));
        };
        let keys = ctx.detach_keys(args.detach_keys.as_deref())?;
        let container = ctx.inspect(target).await?;
        let options = SessionOptions {
            tty: container.tty,
            stdin_open: args.interactive,
            auto_remove: false,
            start: true,
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
        return finish(outcome);
    }

    each_container(ctx, targets, "starting", |id| async move {
        ctx.engine.start_container(&id).await
    })
    .await
}

pub async fn stop(ctx: &Context, args: &StopArgs) -> Result<()> {
    let targets = ctx.targets(&args.targets.containers, args.targets.agent);
    each_container(ctx, targets, "stopping", |id| async move {
        ctx.engine.stop_container(&id, args.time).await
    })
    .await
}

pub async fn restart(ctx: &Context, args: &StopArgs) -> Result<()> {
    let targets = ctx.targets(&args.targets.containers, args.targets.agent);
    each_container(ctx, targets, "restarting", |id| async move {
        ctx.engine.restart_container(&id, args.time).await
    })
    .await
}

pub async fn kill(ctx: &Context, args: &KillArgs) -> Result<()> {
    let targets = ctx.targets(&args.targets.containers, args.targets.agent);
    each_container(ctx, targets, "killing", |id| async move {
        ctx.engine.kill_container(&id, args.signal.as_deref()).await
    })
    .await
}

pub async fn pause(ctx: &Context, args: &TargetsArgs) -> Result<()> {
    let targets = ctx.targets(&args.containers, args.agent);
    each_container(ctx, targets, "pausing", |id| async move {
        ctx.engine.pause_container(&id).await
    })
    .await
}

pub async fn unpause(ctx: &Context, args: &TargetsArgs) -> Result<()> {
    let targets = ctx.targets(&args.containers, args.agent);
    each_container(ctx, targets, "unpausing", |id| async move {
        ctx.engine.unpause_container(&id).await
    })
    .await
}

pub async fn rename(ctx: &Context, args: &RenameArgs) -> Result<()> {
    let old = ctx.target(&args.old, args.agent);
    let new = ctx.target(&args.new, args.agent);
    let container = ctx.inspect(&old).await?;
    ctx.call(
        || format!("renaming container {old} to {new}"),
        ctx.engine.rename_container(&container.id, &new),
    )
    .await?;
    debug!(%old, %new, "renamed");
    Ok(())
}

pub async fn rm(ctx: &Context, args: &RmArgs) -> Result<()> {
    let targets = ctx.targets(&args.targets.containers, args.targets.agent);
    each_container(ctx, targets, "removing", |id| async move {
        ctx.engine.remove_container(&id, args.force, args.volumes).await
    })
    .await
}

/// Run `op` on each target's container ID, printing the target on success.
///
/// Failures are reported per target and the rest still run.
async fn each_container<F, Fut>(
    ctx: &Context,
    targets: Vec<String>,
    verb: &str,
    op: F,
) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<(), EngineError>>,
{
    let mut io = ctx.io();
    let mut bulk = Bulk::new(&mut io);
    for target in targets {
        let result = async {
            let container = ctx.inspect(&target).await?;
            ctx.call(|| format!("{verb} container {target}"), op(container.id))
                .await?;
            Ok::<_, Error>(Some(target.clone()))
        }
        .await;
        bulk.record(result).await?;
    }
    bulk.finish()
}

/// Block until each container stops and print its exit status.
pub async fn wait(ctx: &Context, args: &TargetsArgs) -> Result<()> {
    let mut io = ctx.io();
    let mut bulk = Bulk::new(&mut io);
    for target in ctx.targets(&args.containers, args.agent) {
        let result = async {
            let container = ctx.inspect(&target).await?;
            let op = || format!("waiting for container {target}");
            let handle = ctx
                .call(op, ctx.engine.wait_container(&container.id, WaitCondition::NotRunning))
                .await?;
            let code = ctx.call(op, handle.status()).await?;
            Ok::<_, Error>(Some(code.to_string()))
        }
        .await;
        bulk.record(result).await?;
    }
    bulk.finish()
}

pub async fn rmi(ctx: &Context, args: &RmiArgs) -> Result<()> {
    let mut io = ctx.io();
    let mut bulk = Bulk::new(&mut io);
    for image in &args.images {
        let result = async {
            let items = ctx
                .call(
                    || format!("removing image {image}"),
                    ctx.engine.remove_image(image, args.force),
                )
                .await?;
            let lines: Vec<String> = items
                .iter()
                .flat_map(|item| {
                    let untagged = item.untagged.as_ref().map(|t| format!("Untagged: {t}"));
                    let deleted = item.deleted.as_ref().map(|d| format!("Deleted: {d}"));
                    untagged.into_iter().chain(deleted)
                })
                .collect();
            Ok::<_, Error>((!lines.is_empty()).then(|| lines.join("\n")))
        }
        .await;
        bulk.record(result).await?;
    }
    bulk.finish()
}
