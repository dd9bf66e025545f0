//! CLI subcommand handlers.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tablepub_core::config::{StorageBackend, StoreBackend};
use tablepub_core::notify::{SmtpMailer, WebhookAnnouncer, WebhookLiveChannel};
use tablepub_core::storage::ContentStream;
use tablepub_core::validation::{validate_against_schema, validate_content};
use tablepub_core::{
    BroadcastHub, ChannelJobQueue, Collaborators, CreateDatasetRequest, DatasetMetadata,
    DatasetStore, FileSource, FileStorage, GitHubHost, HttpFetcher, JobRegistry, JobWorker,
    JsonStore, LocalStorage, MemoryStorage, MemoryStore, NewDatasetFile, Notifier, PublishConfig,
    Publisher, ReportOutcome, SchemaLoader, SchemaSpec, StorageKey, TableSchema, UrlSchemaLoader,
    User,
};

use crate::{Commands, ConfigAction, PublishArgs};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Validate { csv, schema } => handle_validate(&csv, schema.as_deref()).await,
        Commands::Publish(args) => handle_publish(args, workspace).await,
        Commands::Status { job_id } => handle_status(&job_id, workspace),
        Commands::Destroy { dataset_id } => handle_destroy(dataset_id, workspace).await,
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load_config(workspace: &Path) -> anyhow::Result<PublishConfig> {
    let config = tablepub_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    for problem in config.validate() {
        tracing::warn!("config: {problem}");
    }
    Ok(config)
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// A publisher wired from configuration, with the worker that runs its jobs.
struct Runtime {
    publisher: Arc<Publisher>,
    worker: JobWorker,
    hub: Option<BroadcastHub>,
}

fn build_runtime(config: &PublishConfig, workspace: &Path) -> anyhow::Result<Runtime> {
    let storage: Arc<dyn FileStorage> = match config.storage.backend {
        StorageBackend::Local => {
            Arc::new(LocalStorage::new(resolve(workspace, &config.storage.root)))
        }
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    let store: Arc<dyn DatasetStore> = match config.store.backend {
        StoreBackend::Json => Arc::new(JsonStore::open(resolve(workspace, &config.store.path))?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let (mut notifier, hub) = match &config.live {
        Some(live) => (Notifier::new(Arc::new(WebhookLiveChannel::new(live))), None),
        None => {
            let hub = BroadcastHub::default();
            (Notifier::new(Arc::new(hub.clone())), Some(hub))
        }
    };
    if let Some(email) = &config.email {
        notifier = notifier.with_mailer(Arc::new(SmtpMailer::new(email)));
    }
    if let Some(announce) = &config.announce {
        notifier = notifier.with_announcer(Arc::new(WebhookAnnouncer::new(announce)));
    }

    let registry = Arc::new(JobRegistry::new(config.jobs.retention()));
    let (queue, rx) = ChannelJobQueue::new(registry.clone());
    let publisher = Arc::new(Publisher::new(Collaborators {
        storage,
        fetcher: Arc::new(HttpFetcher::new()),
        schemas: Arc::new(UrlSchemaLoader::new()),
        host: Arc::new(GitHubHost::new(&config.host)),
        store,
        queue: Arc::new(queue),
        registry: registry.clone(),
        notifier,
    })?);
    let worker = JobWorker::new(rx, publisher.clone(), registry);

    Ok(Runtime {
        publisher,
        worker,
        hub,
    })
}

/// Messages for everything wrong with `csv`, empty when it is valid.
pub async fn validate_file(csv: &Path, schema_url: Option<&str>) -> anyhow::Result<Vec<String>> {
    let bytes = Bytes::from(std::fs::read(csv)?);
    let mut messages = Vec::new();

    let mut stream: ContentStream = Cursor::new(bytes.clone());
    if let Err(e) = validate_content(&mut stream) {
        messages.push(format!("File {e}"));
    }

    if let Some(url) = schema_url {
        let loader = UrlSchemaLoader::new();
        let schema = TableSchema::register("schema", None, url, &loader).await?;
        let storage = MemoryStorage::new();
        let key = StorageKey::generate(&csv.to_string_lossy());
        storage.put(&key, bytes)?;
        let errors =
            validate_against_schema(&schema, &storage, &key, Some(&mut stream), &loader).await;
        for error in errors {
            messages.push(format!("File {error}"));
            if let tablepub_core::ValidationError::SchemaMismatch { violations } = &error {
                messages.extend(violations.iter().map(|v| format!("  - {v}")));
            }
        }
    }
    Ok(messages)
}

async fn handle_validate(csv: &Path, schema: Option<&str>) -> anyhow::Result<()> {
    let messages = validate_file(csv, schema).await?;
    if messages.is_empty() {
        println!("{} is valid", csv.display());
        return Ok(());
    }
    for message in &messages {
        println!("{message}");
    }
    anyhow::bail!("{} is not valid", csv.display())
}

/// Remote files are downloaded by the publisher; local ones are read here.
fn file_source(path: &Path) -> anyhow::Result<FileSource> {
    if let Some(url) = path
        .to_str()
        .filter(|p| p.starts_with("http://") || p.starts_with("https://"))
    {
        return Ok(FileSource::Url {
            url: url.to_string(),
        });
    }
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok(FileSource::Upload {
        filename: path.to_string_lossy().into_owned(),
        bytes: Bytes::from(bytes),
    })
}

fn publish_request(args: &PublishArgs) -> anyhow::Result<CreateDatasetRequest> {
    let mut files = Vec::with_capacity(args.files.len());
    for (title, path) in &args.files {
        files.push(NewDatasetFile {
            title: title.clone(),
            description: None,
            source: file_source(path)?,
            schema: args.schema.as_ref().map(|url| SchemaSpec::Register {
                name: title.clone(),
                description: None,
                url: url.clone(),
            }),
        });
    }

    let mut user = User::new(&args.login);
    user.email = args.email.clone();
    Ok(CreateDatasetRequest {
        metadata: DatasetMetadata {
            name: args.name.clone(),
            description: args.description.clone(),
            publisher_name: args.publisher_name.clone(),
            publisher_url: args.publisher_url.clone(),
            license: args.license.clone(),
            frequency: args.frequency.clone(),
            publishing_method: args.method,
            owner: args.owner.clone(),
        },
        user,
        files,
    })
}

async fn handle_publish(args: PublishArgs, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let mut runtime = build_runtime(&config, workspace)?;
    let request = publish_request(&args)?;
    let mut events = runtime.hub.as_ref().map(BroadcastHub::subscribe);

    let (dataset, outcome) = runtime
        .publisher
        .create_dataset(request, args.channel.as_deref())
        .await?;

    if let Some(rx) = events.as_mut() {
        while let Ok(message) = rx.try_recv() {
            println!("[{}] {}", message.channel, message.event);
        }
    }

    match outcome {
        ReportOutcome::Rejected { messages } => {
            for message in &messages {
                println!("{message}");
            }
            if let Some(job_id) = &dataset.job_id {
                println!("Errors recorded for job {job_id}");
            }
            anyhow::bail!("dataset '{}' was not published", dataset.name())
        }
        ReportOutcome::Persisted { repository_job } => {
            println!("Saved dataset {} ({})", dataset.id, dataset.name());
            if let Some(job_id) = repository_job {
                println!("Building repository (job {job_id})...");
                runtime.worker.drain().await;
                let report = runtime.publisher.job_status(&job_id)?;
                match report.failure {
                    Some(failure) => anyhow::bail!("repository job failed: {failure}"),
                    None => println!("Published to {}", dataset.github_url()),
                }
            }
            Ok(())
        }
    }
}

fn handle_status(job_id: &str, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let runtime = build_runtime(&config, workspace)?;
    let report = runtime.publisher.job_status(job_id)?;
    match report.status {
        Some(status) => println!("Job {}: {}", report.job_id, status),
        None => println!("Job {}: finished", report.job_id),
    }
    if let Some(failure) = &report.failure {
        println!("Failure: {failure}");
    }
    for message in &report.errors {
        println!("  {message}");
    }
    Ok(())
}

async fn handle_destroy(dataset_id: uuid::Uuid, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let runtime = build_runtime(&config, workspace)?;
    runtime.publisher.destroy_dataset(dataset_id).await?;
    println!("Deleted dataset {dataset_id}");
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".tablepub");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PublishConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let mut config = tablepub_core::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            redact(&mut config);
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn redact(config: &mut PublishConfig) {
    const HIDDEN: &str = "********";
    if !config.host.token.is_empty() {
        config.host.token = HIDDEN.into();
    }
    if let Some(token) = config.host.admin_token.as_mut() {
        *token = HIDDEN.into();
    }
    if let Some(email) = config.email.as_mut() {
        if !email.password.is_empty() {
            email.password = HIDDEN.into();
        }
    }
    if let Some(secret) = config.live.as_mut().and_then(|l| l.secret.as_mut()) {
        *secret = HIDDEN.into();
    }
}
