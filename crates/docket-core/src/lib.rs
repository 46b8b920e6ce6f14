pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod duplicates;
pub mod extract;
pub mod gateway;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod render;
pub mod session;
pub mod sync;
pub mod task;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting docket CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.rc_file.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let service =
    api::HttpTaskService::new(
      &cfg.server_url(),
      cfg.server_timeout()
    )?;
  let mut renderer =
    render::Renderer::new(&cfg)?;

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async \
         runtime"
      )?;

  runtime.block_on(async {
    let mut gateway =
      gateway::Gateway::initialize(
        service, &data_dir
      )
      .await
      .with_context(|| {
        format!(
          "failed to open local store \
           at {}",
          data_dir.display()
        )
      })?;

    commands::dispatch(
      &mut gateway,
      &cfg,
      &mut renderer,
      cli.command
    )
    .await
  })?;

  info!("done");
  Ok(())
}
