//! Read-only commands: logs, ps, inspect, stats and top.

use super::{print, Bulk, Context};
use crate::cli::{InspectArgs, LogsArgs, PsArgs, StatsArgs, TopArgs};
use crate::engine::frame::demux_copy;
use crate::engine::{short_id, LogsOptions};
use crate::error::{Error, Result};
use crate::stats::{stats_once, stats_stream, StreamOptions};
use futures::StreamExt;
use regex::{Captures, Regex};
use serde_json::Value;
use std::fmt::Write as _;
use std::io;
use std::sync::{Arc, LazyLock};
use tokio::io::AsyncWriteExt;

static TEMPLATE_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(json\s+)?(\.[A-Za-z0-9_.]*)\s*\}\}").expect("template pattern is valid")
});

/// Render an inspect template such as `{{.State.Status}}` against `value`.
///
/// Supports field paths (`{{.A.B}}`), the whole document (`{{.}}`) and
/// JSON output (`{{json .A}}`). Missing fields render as `<no value>`.
#[must_use]
pub fn render_template(template: &str, value: &Value) -> String {
    let template = template.replace("\\n", "\n").replace("\\t", "\t");
    TEMPLATE_ACTION
        .replace_all(&template, |caps: &Captures<'_>| {
            let field = lookup(value, &caps[2]);
            if caps.get(1).is_some() {
                field.map_or_else(|| "null".to_string(), Value::to_string)
            } else {
                match field {
                    None => "<no value>".to_string(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                }
            }
        })
        .into_owned()
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, key| current.get(key))
}

/// Align `rows` under `headers`, three spaces between columns.
fn render_columns(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.len());
            } else {
                widths.push(cell.len());
            }
        }
    }

    let mut out = String::new();
    let mut push_line = |line: &[&str]| {
        let last = line.len().saturating_sub(1);
        for (i, cell) in line.iter().enumerate() {
            if i == last {
                out.push_str(cell);
            } else {
                let _ = write!(out, "{cell:<width$}   ", width = widths[i]);
            }
        }
        out.push('\n');
    };
    push_line(headers);
    for row in rows {
        let refs: Vec<&str> = row.iter().map(String::as_str).collect();
        push_line(&refs);
    }
    out
}

/// Stream a container's logs. Non-TTY logs are demultiplexed onto
/// stdout and stderr.
pub async fn logs(ctx: &Context, args: &LogsArgs) -> Result<()> {
    let target = ctx.target(&args.container, args.agent);
    let container = ctx.inspect(&target).await?;
    let options = LogsOptions {
        follow: args.follow,
        timestamps: args.timestamps,
        details: args.details,
        tail: args.tail.clone(),
        since: args.since.clone(),
        until: args.until.clone(),
    };
    let chunks = ctx
        .call(
            || format!("reading logs of {target}"),
            ctx.engine.logs(&container.id, &options),
        )
        .await?;
    let mut reader =
        tokio_util::io::StreamReader::new(chunks.map(|chunk| chunk.map_err(io::Error::other)));

    let mut io = ctx.io();
    let copied = async {
        if container.tty {
            tokio::io::copy(&mut reader, &mut io.stdout).await?;
        } else {
            demux_copy(&mut reader, &mut io.stdout, &mut io.stderr).await?;
        }
        io.stdout.flush().await?;
        io.stderr.flush().await
    };
    tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(Error::Interrupted),
        result = copied => Ok(result?),
    }
}

/// List the project's containers.
pub async fn ps(ctx: &Context, args: &PsArgs) -> Result<()> {
    let filter = ctx.project_filter();
    let mut containers = ctx
        .call(
            || "listing containers".to_string(),
            ctx.engine.list_containers(args.all, &filter),
        )
        .await?;
    containers.sort_by(|a, b| b.created.cmp(&a.created));

    let id = |full: &str| {
        if args.no_trunc {
            full.to_string()
        } else {
            short_id(full).to_string()
        }
    };

    let mut io = ctx.io();
    if args.quiet {
        let ids: String = containers.iter().map(|c| format!("{}\n", id(&c.id))).collect();
        return print(&mut io, &ids).await;
    }

    let rows: Vec<Vec<String>> = containers
        .iter()
        .map(|c| {
            vec![
                id(&c.id),
                c.display_name().to_string(),
                c.image.clone(),
                c.status.clone(),
            ]
        })
        .collect();
    print(
        &mut io,
        &render_columns(&["CONTAINER ID", "NAME", "IMAGE", "STATUS"], &rows),
    )
    .await
}

/// Print the raw inspect documents, or one rendered template per container.
pub async fn inspect(ctx: &Context, args: &InspectArgs) -> Result<()> {
    let mut io = ctx.io();
    let mut documents = Vec::new();
    let mut lines = String::new();

    let mut bulk = Bulk::new(&mut io);
    for target in ctx.targets(&args.targets.containers, args.targets.agent) {
        let result = ctx
            .call(
                || format!("inspecting container {target}"),
                ctx.engine.inspect_container_raw(&target),
            )
            .await
            .map(|document| {
                match &args.format {
                    Some(template) => {
                        lines.push_str(&render_template(template, &document));
                        lines.push('\n');
                    }
                    None => documents.push(document),
                }
                None
            });
        bulk.record(result).await?;
    }
    let outcome = bulk.finish();

    if args.format.is_some() {
        print(&mut io, &lines).await?;
    } else {
        let json = serde_json::to_string_pretty(&Value::Array(documents))
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        print(&mut io, &format!("{json}\n")).await?;
    }
    outcome
}

/// Resource usage for the given containers, or the project's running ones.
pub async fn stats(ctx: &Context, args: &StatsArgs) -> Result<()> {
    let targets: Vec<String> = if args.containers.is_empty() {
        let filter = ctx.project_filter();
        ctx.call(
            || "listing containers".to_string(),
            ctx.engine.list_containers(false, &filter),
        )
        .await?
        .iter()
        .map(|c| c.display_name().to_string())
        .collect()
    } else {
        ctx.targets(&args.containers, args.agent)
    };

    let mut io = ctx.io();
    if args.no_stream {
        stats_once(ctx.engine.as_ref(), &targets, args.no_trunc, &mut io.stdout).await?;
        return Ok(());
    }

    let options = StreamOptions {
        no_trunc: args.no_trunc,
        ..StreamOptions::default()
    };
    stats_stream(
        Arc::clone(&ctx.engine),
        &targets,
        options,
        &mut io.stdout,
        &ctx.cancel,
    )
    .await?;
    if ctx.cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }
    Ok(())
}

/// Print the processes running in a container.
pub async fn top(ctx: &Context, args: &TopArgs) -> Result<()> {
    let target = ctx.target(&args.container, args.agent);
    let container = ctx.inspect(&target).await?;
    let ps_args = (!args.ps_args.is_empty()).then(|| args.ps_args.join(" "));
    let top = ctx
        .call(
            || format!("listing processes of {target}"),
            ctx.engine.top(&container.id, ps_args.as_deref()),
        )
        .await?;
    let headers: Vec<&str> = top.titles.iter().map(String::as_str).collect();
    let mut io = ctx.io();
    print(&mut io, &render_columns(&headers, &top.processes)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "Id": "abc123",
            "Name": "/web",
            "State": { "Status": "running", "Running": true, "ExitCode": 0 },
            "Config": { "Labels": { "agentbox.agent": "dev" } },
        })
    }

    #[test]
    fn test_template_fields() {
        let doc = document();
        assert_eq!(render_template("{{.State.Status}}", &doc), "running");
        assert_eq!(render_template("{{ .Name }} {{.State.ExitCode}}", &doc), "/web 0");
        assert_eq!(render_template("{{.State.Running}}", &doc), "true");
    }

    #[test]
    fn test_template_json_and_missing() {
        let doc = document();
        assert_eq!(
            render_template("{{json .Config.Labels}}", &doc),
            r#"{"agentbox.agent":"dev"}"#
        );
        assert_eq!(render_template("{{.State.Pid}}", &doc), "<no value>");
        assert_eq!(render_template("{{json .Nope}}", &doc), "null");
    }

    #[test]
    fn test_template_whole_document() {
        let doc = json!({"A": 1});
        assert_eq!(render_template("{{json .}}", &doc), r#"{"A":1}"#);
        assert_eq!(render_template("id={{.}}", &doc), r#"id={"A":1}"#);
    }

    #[test]
    fn test_columns_align() {
        let table = render_columns(
            &["ID", "NAME"],
            &[vec!["1".to_string(), "alpha".to_string()], vec!["22".to_string(), "b".to_string()]],
        );
        assert_eq!(table, "ID   NAME\n1    alpha\n22   b\n");
    }
}
