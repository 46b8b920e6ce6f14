use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

pub const DEFAULT_SERVER_URL: &str =
  "http://localhost:3000/api";
pub const DEFAULT_TIMEOUT_SECS: u64 =
  30;

const RC_ENV: &str = "DOCKETRC";
const RC_FILE: &str = ".docketrc";

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Config {
  /// Built-in defaults only; no rc
  /// file is read.
  pub fn defaults() -> Self {
    let mut map = HashMap::new();
    for (key, value) in [
      ("data.location", "~/.docket"),
      (
        "server.url",
        DEFAULT_SERVER_URL
      ),
      ("server.timeout", "30"),
      ("color", "on"),
      ("sync.auto", "on")
    ] {
      map.insert(
        key.to_string(),
        value.to_string()
      );
    }
    Config {
      map,
      loaded_files: vec![]
    }
  }

  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Self::defaults();

    let rc =
      resolve_rc_path(rc_override)?;
    if let Some(path) = rc {
      info!(rc = %path.display(), "loading docketrc");
      cfg.load_file(&path)?;
    } else {
      debug!(
        "no docketrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  pub fn server_url(&self) -> String {
    self
      .get("server.url")
      .filter(|url| {
        !url.trim().is_empty()
      })
      .unwrap_or_else(|| {
        DEFAULT_SERVER_URL.to_string()
      })
  }

  /// Falls back to the default when
  /// the value is not a positive
  /// integer.
  pub fn server_timeout(
    &self
  ) -> Duration {
    let secs = self
      .get("server.timeout")
      .and_then(|raw| {
        raw.trim().parse::<u64>().ok()
      })
      .filter(|secs| *secs > 0)
      .unwrap_or_else(|| {
        warn!(
          "invalid server.timeout; \
           using default"
        );
        DEFAULT_TIMEOUT_SECS
      });
    Duration::from_secs(secs)
  }

  pub fn color_enabled(&self) -> bool {
    self
      .get_bool("color")
      .unwrap_or(true)
  }

  pub fn auto_sync(&self) -> bool {
    self
      .get_bool("sync.auto")
      .unwrap_or(true)
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    self.map.iter()
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line = raw_line
        .split_once('#')
        .map_or(raw_line, |(before, _)| {
          before
        })
        .trim();
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        if self
          .loaded_files
          .contains(&include_path)
        {
          warn!(include = %include_path.display(), "include cycle; skipping");
          continue;
        }
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var(RC_ENV)
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping docketrc"
    );
    return Ok(None);
  };
  let candidate = home.join(RC_FILE);
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".docket"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}
