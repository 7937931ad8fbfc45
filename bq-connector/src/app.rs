use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bq_config::{Action, Configuration, TableDefinition, WriterSettings};
use bq_writer::factory::create_client;
use bq_writer::warehouse::Warehouse;
use bq_writer::writer::{PollSettings, TableWriter};
use tracing::info;

use crate::error::{ConnectorError, ConnectorResult};
use crate::listing::{
    DatasetEntry, ProjectEntry, list_datasets, list_projects, list_projects_with_datasets,
};

/// Directory below the data directory holding the input CSV files.
const INPUT_TABLES_DIR: &str = "in/tables";

/// One job run against the platform data directory.
#[derive(Debug)]
pub struct App {
    data_dir: PathBuf,
    configuration: Configuration,
    settings: WriterSettings,
}

impl App {
    /// Validates the configuration before anything is sent to BigQuery.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        configuration: Configuration,
        settings: WriterSettings,
    ) -> ConnectorResult<Self> {
        configuration.validate()?;
        settings.validate()?;

        Ok(Self {
            data_dir: data_dir.into(),
            configuration,
            settings,
        })
    }

    /// Connects to BigQuery with the configured credentials and runs the requested action.
    pub async fn run<O: Write + Send>(&self, out: &mut O) -> ConnectorResult<()> {
        let project_id = self.configuration.project_id()?;
        let credentials = self.configuration.credentials()?;
        let client = create_client(&project_id, &credentials, self.configuration.location())?;

        self.execute(Arc::new(client), out).await
    }

    /// Runs the requested action against `warehouse`, printing progress and listings to `out`.
    pub async fn execute<W, O>(&self, warehouse: Arc<W>, out: &mut O) -> ConnectorResult<()>
    where
        W: Warehouse + Send + Sync + 'static,
        O: Write + Send,
    {
        let action = self.configuration.action()?;
        info!(%action, "running action");

        match action {
            Action::Run => self.write_tables(warehouse, out).await,
            Action::List => {
                let projects = list_projects_with_datasets(&*warehouse).await?;
                print_json(out, &serde_json::json!({ "projects": projects }))
            }
            Action::ListProjects => {
                let projects: Vec<ProjectEntry> = list_projects(&*warehouse).await?;
                print_json(out, &projects)
            }
            Action::ListDatasets => {
                let datasets: Vec<DatasetEntry> =
                    list_datasets(&*warehouse, warehouse.project_id()).await?;
                print_json(out, &datasets)
            }
        }
    }

    async fn write_tables<W, O>(&self, warehouse: Arc<W>, out: &mut O) -> ConnectorResult<()>
    where
        W: Warehouse + Send + Sync + 'static,
        O: Write + Send,
    {
        let dataset = self.configuration.dataset()?;
        let tables = self
            .configuration
            .tables()?
            .iter()
            .filter(|table| table.export)
            .map(|table| -> ConnectorResult<_> { Ok((table, self.input_path(table)?)) })
            .collect::<ConnectorResult<Vec<_>>>()?;

        let writer = TableWriter::new(warehouse, self.settings.scratch_root());
        let poll = PollSettings::new(
            self.settings.poll_interval_seconds,
            self.settings.max_poll_retries,
        );

        for (table, csv_path) in tables {
            writeln!(
                out,
                "Loading table {} into BigQuery as {dataset}.{}",
                table.table_id,
                table.db_name.trim()
            )?;
            out.flush()?;

            writer
                .write_sync(&csv_path, dataset, table, table.incremental, poll)
                .await?;
        }

        writeln!(out, "BigQuery Writer finished")?;

        Ok(())
    }

    /// Resolves the CSV file of `table` through its input mapping.
    fn input_path(&self, table: &TableDefinition) -> ConnectorResult<PathBuf> {
        if table.items.is_none() {
            return Err(ConnectorError::User(format!(
                "Key 'items' not defined in '{}' table definition.",
                table.table_id
            )));
        }

        let mut matches = self
            .configuration
            .input_tables()
            .iter()
            .filter(|mapping| mapping.source == table.table_id);
        let mapping = match (matches.next(), matches.next()) {
            (Some(mapping), None) => mapping,
            (None, _) => {
                return Err(ConnectorError::User(format!(
                    "Missing input mapping for table {}.",
                    table.table_id
                )));
            }
            (Some(_), Some(_)) => {
                return Err(ConnectorError::User(format!(
                    "Multiple input mappings for table {}.",
                    table.table_id
                )));
            }
        };

        Ok(self.input_tables_dir().join(&mapping.destination))
    }

    fn input_tables_dir(&self) -> PathBuf {
        self.data_dir.join(Path::new(INPUT_TABLES_DIR))
    }
}

fn print_json<O: Write, T: serde::Serialize>(out: &mut O, value: &T) -> ConnectorResult<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;

    Ok(())
}
