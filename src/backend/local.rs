//! Local filesystem backend (`spec.md` §4.5, §6 "Process (gateway ↔ git
//! binary)"): spawns the `git` executable against a repository directory.
//!
//! Grounded in the teacher's `methods::repo::smart_git::handle` —
//! subprocess spawn with piped stdio, forwarding the request body into
//! `stdin`, and streaming `stdout` back via an `mpsc` channel — adapted
//! from invoking `git http-backend` as a CGI program to invoking
//! `git {service} --advertise-refs|--stateless-rpc` directly, the way
//! `minionrt-cli`'s `git-proxy` routes do.

use std::io;
use std::path::Path;
use std::process::Stdio;

use anyhow::Context as _;
use axum::http::{header, HeaderValue};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, instrument, Instrument};

use super::EnabledDefaults;
use crate::context::{Context, ResponseBody};
use crate::error::GatewayError;
use crate::service::Service;

/// `checkIfExists`, local branch: stats `<repo>/HEAD`. `EACCES` is treated
/// as existing — a restrictive access policy still means the repo is
/// there.
pub async fn check_if_exists(repo_path: &Path) -> bool {
    match tokio::fs::metadata(repo_path.join("HEAD")).await {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => true,
        Err(_) => false,
    }
}

fn daemon_key(service: Service) -> &'static str {
    match service {
        Service::UploadPack => "daemon.uploadpack",
        Service::ReceivePack => "daemon.receivepack",
    }
}

/// `checkIfEnabled`, local branch: `git -C <path> config --bool
/// daemon.{uploadpack|receivepack}`.
pub async fn check_if_enabled(repo_path: &Path, service: Service, defaults: EnabledDefaults) -> bool {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .arg("config")
        .arg("--bool")
        .arg(daemon_key(service))
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            String::from_utf8_lossy(&out.stdout).trim() == "true"
        }
        _ => defaults.for_service(service),
    }
}

/// `serve`, local branch. Spawns `git -C <path> {service}
/// --advertise-refs .` (advertising) or `--stateless-rpc .` (serving,
/// piping the request body to stdin), streams `stdout` into the response
/// body, and sets `Content-Type`/clears `Content-Length` per `spec.md`.
#[instrument(skip(ctx), fields(service = %service, advertisement))]
pub async fn serve(
    repo_path: &Path,
    service: Service,
    advertisement: bool,
    ctx: &Context,
) -> Result<(), GatewayError> {
    let mode_flag = if advertisement {
        "--advertise-refs"
    } else {
        "--stateless-rpc"
    };

    let mut command = Command::new("git");
    command
        .arg("-C")
        .arg(repo_path)
        .arg(service.wire_name())
        .arg(mode_flag)
        .arg(".")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !advertisement {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    if let Some(value) = ctx.headers().get("Git-Protocol") {
        if let Ok(text) = value.to_str() {
            command.env("GIT_PROTOCOL", text);
        }
    }
    if let Some(value) = ctx.headers().get(header::CONTENT_ENCODING) {
        if let Ok(text) = value.to_str() {
            command.env("HTTP_CONTENT_ENCODING", text);
        }
    }

    let mut child = command.spawn().map_err(|e| GatewayError::GitExecutionFailure {
        service: service.wire_name(),
        exit_code: None,
        stderr: e.to_string(),
    })?;

    if !advertisement {
        if let Some(mut body) = ctx.take_body().await {
            let mut stdin = child.stdin.take().expect("stdin piped when !advertisement");
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| GatewayError::BackendFailure { inner: e.into() })?;
                stdin
                    .write_all(&chunk)
                    .await
                    .context("failed writing request body to git stdin")
                    .map_err(|inner| GatewayError::BackendFailure { inner })?;
            }
            drop(stdin);
        }
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (tx, rx) = mpsc::channel(8);
    let service_name = service.wire_name();
    tokio::spawn(
        forward_stdout(stdout, stderr, child, tx, service_name)
            .instrument(tracing::info_span!("git subprocess", service = service_name)),
    );

    ctx.insert_response_header(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&format!(
            "application/x-git-{service}-{}",
            if advertisement { "advertisement" } else { "result" }
        ))
        .expect("content-type is always valid ascii"),
    );
    ctx.remove_response_header(&header::CONTENT_LENGTH);
    ctx.set_response_body(ResponseBody::Stream(Box::pin(
        ReceiverStream::new(rx).map(|r| r.map_err(io::Error::other)),
    )));

    Ok(())
}

async fn forward_stdout(
    mut stdout: tokio::process::ChildStdout,
    mut stderr: ChildStderr,
    mut child: Child,
    tx: mpsc::Sender<Result<Bytes, GatewayError>>,
    service: &'static str,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let (item, done) = match stdout.read_buf(&mut buf).await {
            Ok(0) => (Ok(buf.split().freeze()), true),
            Ok(n) => (Ok(buf.split_to(n).freeze()), false),
            Err(e) => (
                Err(GatewayError::BackendFailure { inner: e.into() }),
                true,
            ),
        };

        let stop = tx.send(item).await.is_err();
        if done || stop {
            break;
        }
    }

    print_status(&mut child, &mut stderr, service).await;
}

/// Logs subprocess exit status, the way the teacher's `print_status` does.
async fn print_status(child: &mut Child, stderr: &mut ChildStderr, service: &str) {
    let mut stderr_out = String::new();
    let _ = stderr.read_to_string(&mut stderr_out).await;

    match child.wait().await {
        Ok(status) if status.success() => {
            debug!(%service, stderr = stderr_out.as_str(), "git subprocess exited cleanly");
        }
        Ok(status) => {
            error!(%service, stderr = stderr_out.as_str(), %status, "git subprocess exited non-zero");
        }
        Err(e) => {
            error!(%service, error = %e, "failed waiting on git subprocess");
        }
    }
}
