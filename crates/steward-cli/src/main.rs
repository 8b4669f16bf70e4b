use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steward_core::app::{BoxError, ConfigKey, Effector, EffectorContext, ManagementContext};
use steward_core::domain::effector::{START, STOP};
use steward_core::domain::sensor::web;
use steward_core::domain::{
    AttributeValue, EffectorSpec, EntityConfig, EntityId, LocationAction, ParameterSpec,
    Parameters, PolicySpec, SensorEvent, SubscriptionFilter, ValueType,
};
use steward_core::impls::{FileMementoStore, InMemoryLocation, InMemoryMementoStore};
use steward_core::ports::MementoStore;
use steward_core::{ContextBuilder, RuntimeConfig, TypeDescriptor};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Steward demo: manage a small web application on a simulated localhost
#[derive(Parser)]
#[command(name = "steward")]
#[command(version)]
struct Cli {
    /// Runtime configuration (JSON)
    #[arg(short, long, env = "STEWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "STEWARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "STEWARD_LOG_JSON")]
    json: bool,

    /// Persist the snapshot here instead of in memory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Simulated requests against web-1
    #[arg(long, default_value_t = 10)]
    requests: i64,

    /// Rate window override in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,
}

/// deploy: デモ用のカスタム effector
struct Deploy;

#[async_trait]
impl Effector for Deploy {
    fn spec(&self) -> EffectorSpec {
        EffectorSpec::new("deploy", "Deploy an artifact to the web server")
            .param(ParameterSpec::required("artifact", ValueType::Text))
    }

    async fn invoke(
        &self,
        ctx: &EffectorContext,
        params: Parameters,
    ) -> steward_core::Result<serde_json::Value> {
        let artifact = params
            .get("artifact")
            .and_then(AttributeValue::as_str)
            .unwrap_or_default()
            .to_string();
        ctx.execute(LocationAction::new("deploy").with_args(json!({ "artifact": artifact })))
            .await?;

        let mut deployed = ctx
            .attribute(web::DEPLOYED_ARTIFACTS.name())
            .and_then(|v| v.as_text_set().cloned())
            .unwrap_or_default();
        deployed.insert(artifact);
        ctx.set_sensor(&web::DEPLOYED_ARTIFACTS, AttributeValue::TextSet(deployed.clone()))?;
        Ok(json!({ "deployed": deployed }))
    }
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(cli: &Cli) -> CliResult<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_json_file(path)?,
        None => RuntimeConfig::default(),
    };
    // CLI の指定がファイルより優先
    if let Some(ms) = cli.window_ms {
        config.policies.rate_window_ms = ms;
    }
    if cli.snapshot_dir.is_some() {
        config.persistence.dir = cli.snapshot_dir.clone();
    }
    Ok(config)
}

fn print_tree(title: &str, ctx: &ManagementContext) -> CliResult<()> {
    println!("== {title}");
    for root in ctx.roots() {
        print_entity(ctx, root, 0)?;
    }
    Ok(())
}

fn print_entity(ctx: &ManagementContext, id: EntityId, depth: usize) -> CliResult<()> {
    let entity = ctx.entity(id)?;
    println!(
        "{:indent$}{} [{}] {} {}",
        "",
        entity.display_name().unwrap_or("-"),
        entity.type_name(),
        entity.lifecycle(),
        id,
        indent = depth * 2
    );
    for (name, attr) in entity.attributes().snapshot() {
        println!(
            "{:indent$}  {name} = {} (seq {})",
            "",
            attr.value.to_json(),
            attr.sequence,
            indent = depth * 2
        );
    }
    for child in entity.children() {
        print_entity(ctx, child, depth + 1)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let config = load_config(&cli)?;

    // (A) 型・Location・設定を登録した builder（rebind でも使い回す）
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let builder = ContextBuilder::new()
        .with_config(config.clone())
        .register_type(TypeDescriptor::group("app").description("Application group"))
        .register_type(
            TypeDescriptor::new("webserver")
                .description("Simulated HTTP server")
                .sensor(web::ROOT_URL)
                .sensor(web::REQUEST_COUNT)
                .sensor(web::REQUESTS_PER_SECOND)
                .sensor(web::DEPLOYED_ARTIFACTS)
                .config_key(ConfigKey::new("http.port", "Listen port").with_default(8080))
                .effector(Deploy),
        )
        .with_location(localhost.clone())
        .expect_types(&["app", "webserver"]);
    let ctx = builder.clone().build()?;

    // (B) app + web-1 + web-2
    let app = ctx.create_entity("app", EntityConfig::new().with("name", "demo"), None)?;
    let web1 = ctx.create_entity(
        "webserver",
        EntityConfig::new().with("name", "web-1").with("http.port", 8081),
        Some(app),
    )?;
    ctx.create_entity(
        "webserver",
        EntityConfig::new().with("name", "web-2").with("http.port", 8082),
        Some(app),
    )?;

    ctx.subscribe(
        SubscriptionFilter::descendants_of(app).sensor(web::REQUESTS_PER_SECOND.name()),
        Arc::new(|ev: &SensorEvent| -> Result<(), BoxError> {
            info!(entity = %ev.source, rate = ?ev.value.as_f64(), seq = ev.sequence, "rate");
            Ok(())
        }),
    )?;

    ctx.invoke(app, START, Parameters::new())?.wait().await?;
    ctx.add_policy_spec(
        web1,
        PolicySpec::new("windowed-rate", json!({ "source": web::REQUEST_COUNT.name() })),
    )?;

    // (C) トラフィックを流してレートを観測
    for n in 1..=cli.requests {
        ctx.set_sensor(web1, &web::REQUEST_COUNT, AttributeValue::Integer(n))?;
        sleep(Duration::from_millis(20)).await;
    }
    sleep(config.rate_period() * 2).await;

    let mut params = Parameters::new();
    params.insert("artifact".into(), AttributeValue::from("hello.war"));
    let deployed = ctx.invoke(web1, "deploy", params)?.wait().await?;
    println!("deploy -> {deployed}");
    print_tree("live", &ctx)?;

    // (D) 永続化 → 元のコンテキストを終了（エンティティは動いたまま）
    let store: Box<dyn MementoStore> = match &config.persistence.dir {
        Some(dir) => Box::new(FileMementoStore::new(dir.clone())),
        None => Box::new(InMemoryMementoStore::new()),
    };
    ctx.persist(store.as_ref()).await?;
    ctx.terminate().await;

    // (E) rebind して止める
    let Some(set) = store.load().await? else {
        return Err("snapshot disappeared".into());
    };
    let rebound = builder.rebind(&set).await?;
    print_tree("rebound", &rebound)?;
    println!("location usage: {:?}", rebound.location_usage());

    rebound.invoke(app, STOP, Parameters::new())?.wait().await?;
    print_tree("stopped", &rebound)?;
    println!("machines left: {}", localhost.machine_count());
    rebound.terminate().await;
    Ok(())
}
