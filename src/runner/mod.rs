//! Wires configuration into running watchers.
//!
//! [`Agent::start`] opens the offset store and storage, migrates each input's table and
//! starts one [`DirectoryWatcher`] per input. [`run`] keeps the agent up until ctrl-c.

use crate::checkpoint::{CheckpointDB, OffsetStore};
use crate::config::{Config, InputConfig};
use crate::parsers::RegexParser;
use crate::processor::StorageProcessor;
use crate::rotation::{Rotator, SizeRotator};
use crate::storage::SqliteStorage;
use crate::tailer::TailerConfig;
use crate::watcher::DirectoryWatcher;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A running agent: one watcher per configured input, all writing to one storage.
pub struct Agent {
    storage: Arc<SqliteStorage>,
    watchers: Vec<(String, DirectoryWatcher)>,
}

impl Agent {
    pub async fn start(config: &Config) -> Result<Self> {
        let offsets_path = config.offsets_path();
        let offsets: Arc<dyn OffsetStore> = Arc::new(
            CheckpointDB::new(&offsets_path).with_context(|| {
                format!("failed to open offset store {}", offsets_path.display())
            })?,
        );

        let storage_config = config.storage_config();
        let storage = Arc::new(
            SqliteStorage::open(&storage_config)
                .with_context(|| format!("failed to open storage {}", storage_config.path))?,
        );

        let mut agent = Self {
            storage,
            watchers: Vec::with_capacity(config.inputs.len()),
        };

        for input in &config.inputs {
            match start_input(
                input,
                agent.storage.clone(),
                offsets.clone(),
                config.debounce_interval(),
            )
            .await
            {
                Ok(watcher) => agent.watchers.push((input.name.clone(), watcher)),
                Err(err) => {
                    agent.shutdown().await;
                    return Err(err);
                }
            }
        }

        info!(inputs = agent.watchers.len(), "agent started");
        Ok(agent)
    }

    pub fn storage(&self) -> &Arc<SqliteStorage> {
        &self.storage
    }

    /// Stop every watcher, then close storage.
    pub async fn shutdown(self) {
        for (name, watcher) in &self.watchers {
            watcher.stop().await;
            info!(input = %name, "input stopped");
        }

        if let Err(err) = self.storage.close().await {
            warn!(error = %err, "failed to close storage cleanly");
        }
    }
}

async fn start_input(
    input: &InputConfig,
    storage: Arc<SqliteStorage>,
    offsets: Arc<dyn OffsetStore>,
    debounce_interval: Duration,
) -> Result<DirectoryWatcher> {
    storage
        .migrate(&input.name, &input.fields)
        .await
        .with_context(|| format!("failed to migrate table for input {:?}", input.name))?;

    let parser = RegexParser::new(&input.pattern)
        .with_context(|| format!("invalid line pattern for input {:?}", input.name))?;

    let rotator = input
        .rotation
        .as_ref()
        .map(|rotation| Arc::new(SizeRotator::from_config(rotation)) as Arc<dyn Rotator>);

    let tailer_config = TailerConfig {
        parser: Arc::new(parser),
        processor: Arc::new(StorageProcessor::new(
            input.name.clone(),
            input.fields.clone(),
            storage,
        )),
        offsets,
        rotator,
        debounce_interval,
    };

    let watch_path = input.watch_path();
    let watcher = DirectoryWatcher::new(&watch_path, tailer_config).with_context(|| {
        format!(
            "invalid watch path {} for input {:?}",
            watch_path.display(),
            input.name
        )
    })?;
    watcher.start();

    info!(
        input = %input.name,
        dir = %watcher.directory().display(),
        file_pattern = %watcher.pattern().as_str(),
        fields = input.fields.len(),
        "input started"
    );
    Ok(watcher)
}

/// Run until ctrl-c, then shut down.
pub async fn run(config: &Config) -> Result<()> {
    info!("logtail-agent starting");
    let agent = Agent::start(config).await?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed while waiting for shutdown signal");
    }
    info!("shutdown signal received");

    agent.shutdown().await;
    info!("logtail-agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Query;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn config_for(dir: &std::path::Path) -> Config {
        let raw = format!(
            r#"
            [agent]
            offsets_path = "{offsets}"
            debounce_ms = 10

            [storage]
            path = "{storage}"

            [[inputs]]
            name = "app"
            path = '{logs}/app-(?P<host>\w+)\.log'
            pattern = '^(?P<level>[A-Z]+) (?P<status>\d+) (?P<message>.*)$'
            fields = [
                {{ name = "level" }},
                {{ name = "status", type = "int" }},
                {{ name = "message" }},
                {{ name = "host" }},
            ]
            "#,
            offsets = dir.join("state/offsets.db").display(),
            storage = dir.join("state/logs.db").display(),
            logs = dir.join("logs").display(),
        );
        let config: Config = toml::from_str(&raw).expect("config");
        config.validate().expect("valid config");
        config
    }

    async fn query_rows(agent: &Agent, expected: usize) -> Vec<serde_json::Value> {
        for _ in 0..500 {
            let mut out = Vec::new();
            let count = agent
                .storage()
                .query("app", &Query::default(), &mut out)
                .await
                .expect("query");
            if count >= expected {
                return String::from_utf8(out)
                    .expect("utf8")
                    .lines()
                    .map(|line| serde_json::from_str(line).expect("json"))
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingests_lines_into_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("logs")).expect("logs dir");
        let log = dir.path().join("logs/app-web01.log");
        std::fs::write(&log, "INFO 200 ok\nnoise\n").expect("write log");

        let agent = Agent::start(&config_for(dir.path())).await.expect("start");
        let rows = query_rows(&agent, 1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["level"], "INFO");
        assert_eq!(rows[0]["status"], 200);
        assert_eq!(rows[0]["host"], "web01");
        assert_eq!(rows[0]["_cursor"], 1);

        let mut file = OpenOptions::new().append(true).open(&log).expect("open");
        file.write_all(b"ERROR 500 boom\n").expect("append");
        let rows = query_rows(&agent, 2).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["message"], "boom");

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_bad_line_pattern() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_for(dir.path());
        config.inputs[0].pattern = "(unclosed".to_string();
        assert!(Agent::start(&config).await.is_err());
    }
}
