use super::{eprint, Context};
use crate::cli::CpArgs;
use crate::copy::{copy_from_container, copy_to_container, plan_transfer, CopyOptions, Transfer};
use crate::error::Result;
use crate::stats::format_bytes;

pub async fn cp(ctx: &Context, args: &CpArgs) -> Result<()> {
    let agent = args
        .agent
        .as_deref()
        .map(|agent| ctx.target(agent, true));
    let transfer = plan_transfer(&args.src, &args.dst, agent.as_deref())?;
    let options = CopyOptions {
        follow_link: args.follow_link,
        copy_uid_gid: args.archive || args.copy_uidgid,
    };

    let mut io = ctx.io();
    match transfer {
        Transfer::FromContainer {
            container,
            path,
            dest,
        } => {
            let container = ctx.inspect(&container).await?;
            let bytes = copy_from_container(
                ctx.engine.as_ref(),
                &container.id,
                &path,
                &dest,
                options,
                &mut io.stdout,
                &ctx.cancel,
            )
            .await?;
            if dest != "-" {
                eprint(
                    &mut io,
                    &format!("Successfully copied {} to {dest}\n", format_bytes(bytes)),
                )
                .await?;
            }
        }
        Transfer::ToContainer {
            source,
            container,
            path,
        } => {
            let reference = ctx.inspect(&container).await?;
            let stdin = std::mem::replace(&mut io.stdin, Box::new(tokio::io::empty()));
            let bytes = copy_to_container(
                ctx.engine.as_ref(),
                &source,
                &reference.id,
                &path,
                options,
                Box::pin(stdin),
                &ctx.cancel,
            )
            .await?;
            if source != "-" {
                eprint(
                    &mut io,
                    &format!(
                        "Successfully copied {} to {container}:{path}\n",
                        format_bytes(bytes)
                    ),
                )
                .await?;
            }
        }
    }
    Ok(())
}
