use crate::{
    capability::ConflictState,
    categories::CategoryCatalog,
    config::AppConfig,
    logging,
    overlay::{OverlaySnapshot, SharedOverlay, BASE_ORIGIN},
    registry::{ModRegistry, RegistryEvent, RegistryServices, OVERWRITE_NAME},
    remote::{HttpNexusBridge, HttpWorkshopClient, NexusBridge, OfflineNexusBridge},
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};

const UPDATE_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct GlobalOptions {
    format: Option<OutputFormat>,
    config: Option<PathBuf>,
    verbose: bool,
}

impl GlobalOptions {
    fn format(&self) -> OutputFormat {
        self.format.unwrap_or(OutputFormat::Text)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Mods { filter: Option<String> },
    Conflicts,
    Rename { position: usize, name: String },
    Remove { position: usize },
    Update { name: String },
    Paths,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modroster v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config = match &global.config {
                Some(path) => AppConfig::load_from(path)?,
                None => AppConfig::load_or_create()?,
            };
            let log_path = logging::init(&config.data_dir(), global.verbose)?;
            let session = Session::open(config, log_path)?;
            run_command(&session, command, global.format())
        }
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let command = parse_subcommand(&tokens)?;
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions::default();
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            global.format = Some(parse_format(value)?);
            continue;
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            global.config = Some(PathBuf::from(value));
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--format requires a value"))?;
                global.format = Some(parse_format(value)?);
            }
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--config requires a path"))?;
                global.config = Some(PathBuf::from(value));
            }
            "-v" | "--verbose" => global.verbose = true,
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((global, tokens))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value).ok_or_else(|| anyhow!("Unknown format: {value} (use 'text' or 'json')"))
}

fn parse_subcommand(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    match head.as_str() {
        "mods" => Ok(CliCommand::Mods {
            filter: parse_filter(rest)?,
        }),
        "conflicts" => Ok(CliCommand::Conflicts),
        "rename" => {
            let [position, name] = rest else {
                bail!("rename requires a position and a new name");
            };
            Ok(CliCommand::Rename {
                position: parse_position(position)?,
                name: name.to_string(),
            })
        }
        "remove" => {
            let [position] = rest else {
                bail!("remove requires a position");
            };
            Ok(CliCommand::Remove {
                position: parse_position(position)?,
            })
        }
        "update" => {
            let name = rest.join(" ");
            if name.trim().is_empty() {
                bail!("update requires a mod name");
            }
            Ok(CliCommand::Update { name })
        }
        "paths" => Ok(CliCommand::Paths),
        "help" | "--help" | "-h" => Ok(CliCommand::Help),
        "version" | "--version" | "-V" => Ok(CliCommand::Version),
        other => bail!("Unknown command: {other} (see 'modroster help')"),
    }
}

fn parse_filter(args: &[String]) -> Result<Option<String>> {
    let mut filter = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "list" => {}
            "--filter" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--filter requires a value"))?;
                filter = Some(value.to_string());
            }
            value if value.starts_with("--filter=") => {
                filter = Some(value.trim_start_matches("--filter=").to_string());
            }
            other => bail!("Unknown mods option: {other}"),
        }
    }
    Ok(filter)
}

fn parse_position(value: &str) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("invalid position: {value}"))
}

/// Loaded registry plus the overlay its conflict checks read from.
struct Session {
    config: AppConfig,
    log_path: PathBuf,
    overlay: Arc<SharedOverlay>,
    registry: ModRegistry,
}

impl Session {
    fn open(config: AppConfig, log_path: PathBuf) -> Result<Self> {
        let catalog = CategoryCatalog::load_or_create(&config.data_dir())?;
        let overlay = Arc::new(SharedOverlay::default());
        let nexus: Arc<dyn NexusBridge> = match config.nexus_api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {
                Arc::new(HttpNexusBridge::new(key, &config.nexus_game_domain))
            }
            _ => Arc::new(OfflineNexusBridge),
        };
        let services = RegistryServices {
            overlay: overlay.clone(),
            nexus,
            workshop: Arc::new(HttpWorkshopClient::new()),
            catalog: Arc::new(catalog),
            clock: Arc::new(crate::clock::SystemClock),
        };
        let registry = ModRegistry::new(config.registry_settings(), services);
        registry.refresh_from_disk();
        let session = Self {
            config,
            log_path,
            overlay,
            registry,
        };
        session.rebuild_overlay();
        Ok(session)
    }

    /// Stacks the installed mods over the game data in list order, with the
    /// overwrite directory on top.
    fn rebuild_overlay(&self) {
        let settings = self.registry.settings();
        let mut builder =
            OverlaySnapshot::builder().origin_dir(BASE_ORIGIN, 0, &settings.data_dir);
        let mut priority = 1;
        for entry in self.registry.entries() {
            let entry = entry.read();
            if entry.conflicts().is_none() {
                continue;
            }
            builder = builder.origin_dir(&entry.internal_name(), priority, &entry.absolute_path());
            priority += 1;
        }
        builder = builder.origin_dir(OVERWRITE_NAME, i32::MAX, &settings.overwrite_dir);
        self.overlay.replace(builder.build());
        self.registry.clear_caches();
    }
}

fn run_command(session: &Session, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::Mods { filter } => list_mods(session, filter.as_deref(), format),
        CliCommand::Conflicts => list_conflicts(session, format),
        CliCommand::Rename { position, name } => {
            session.registry.rename(position, &name)?;
            println!("Renamed to {name}");
            Ok(())
        }
        CliCommand::Remove { position } => {
            let name = session.registry.get_by_position(position)?.read().name();
            session.registry.remove(position)?;
            println!("Removed {name}");
            Ok(())
        }
        CliCommand::Update { name } => request_update(session, &name),
        CliCommand::Paths => list_paths(session, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

#[derive(Serialize)]
struct ModListItem {
    position: usize,
    name: String,
    flags: Vec<&'static str>,
    contents: Vec<&'static str>,
    conflict: &'static str,
    version: Option<String>,
    newest_version: Option<String>,
    update_available: bool,
    description: String,
}

fn list_mods(session: &Session, filter: Option<&str>, format: OutputFormat) -> Result<()> {
    let mut items: Vec<ModListItem> = session
        .registry
        .entries()
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            let entry = entry.read();
            let version = entry
                .get::<crate::capability::Versioned>()
                .map(|versioned| versioned.get())
                .filter(|version| version.is_valid())
                .map(|version| version.to_string());
            let newest_version = entry
                .repository()
                .map(|repository| repository.info().newest_version())
                .filter(|version| version.is_valid())
                .map(|version| version.to_string());
            ModListItem {
                position,
                name: entry.name(),
                flags: entry.flags().into_iter().map(|flag| flag.label()).collect(),
                contents: entry.contents().into_iter().map(|kind| kind.label()).collect(),
                conflict: entry
                    .conflicts()
                    .map(|conflicts| conflicts.state())
                    .unwrap_or_default()
                    .label(),
                version,
                newest_version,
                update_available: entry.update_available(),
                description: entry.description(),
            }
        })
        .collect();

    if let Some(filter) = filter {
        let needle = filter.to_lowercase();
        items.retain(|item| item.name.to_lowercase().contains(&needle));
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            for item in items {
                let update = if item.update_available { "*" } else { " " };
                let version = item.version.unwrap_or_else(|| "-".to_string());
                println!(
                    "{position:>3} {update} {conflict:<14} {version:<10} {name}",
                    position = item.position,
                    conflict = item.conflict,
                    name = item.name
                );
                if !item.flags.is_empty() {
                    println!("      flags: {}", item.flags.join(", "));
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ConflictItem {
    name: String,
    state: ConflictState,
    overwrites: Vec<String>,
    overwritten_by: Vec<String>,
}

fn list_conflicts(session: &Session, format: OutputFormat) -> Result<()> {
    let entries = session.registry.entries();
    let name_at = |position: &usize| {
        entries
            .get(*position)
            .map(|entry| entry.read().name())
            .unwrap_or_else(|| format!("#{position}"))
    };
    let items: Vec<ConflictItem> = entries
        .iter()
        .filter_map(|entry| {
            let (name, record) = {
                let entry = entry.read();
                (entry.name(), entry.conflicts()?.record())
            };
            (record.state != ConflictState::None).then(|| ConflictItem {
                name,
                state: record.state,
                overwrites: record.overwriting.iter().map(name_at).collect(),
                overwritten_by: record.overwritten_by.iter().map(name_at).collect(),
            })
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No conflicts");
            }
            for item in items {
                println!("{} ({})", item.name, item.state.label());
                if !item.overwrites.is_empty() {
                    println!("  overwrites: {}", item.overwrites.join(", "));
                }
                if !item.overwritten_by.is_empty() {
                    println!("  overwritten by: {}", item.overwritten_by.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn request_update(session: &Session, name: &str) -> Result<()> {
    let events = session.registry.subscribe();
    if !session.registry.request_update(name)? {
        bail!("{name} has no repository id to query");
    }
    if !session.registry.wait_for_reply(UPDATE_WAIT) {
        bail!("no answer for {name} after {}s", UPDATE_WAIT.as_secs());
    }
    for event in events.try_iter() {
        if let RegistryEvent::ModDetailsUpdated {
            success, message, ..
        } = event
        {
            if !success {
                bail!(
                    "update failed: {}",
                    message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
    }

    let entry = session.registry.get_by_name(name)?;
    let entry = entry.read();
    let newest = entry
        .repository()
        .map(|repository| repository.info().newest_version().to_string())
        .unwrap_or_default();
    if entry.update_available() {
        println!("{name}: update available ({newest})");
    } else {
        println!("{name}: up to date ({newest})");
    }
    Ok(())
}

#[derive(Serialize)]
struct PathsOutput {
    config: String,
    log: String,
    mods_dir: String,
    overwrite_dir: String,
    game_data_dir: String,
    workshop_manifest: Option<String>,
    workshop_content_dir: Option<String>,
}

fn list_paths(session: &Session, format: OutputFormat) -> Result<()> {
    let config = &session.config;
    let output = PathsOutput {
        config: config.path().display().to_string(),
        log: session.log_path.display().to_string(),
        mods_dir: config.mods_dir.display().to_string(),
        overwrite_dir: config.overwrite_dir.display().to_string(),
        game_data_dir: config.game_data_dir().display().to_string(),
        workshop_manifest: config
            .workshop_manifest()
            .map(|path| path.display().to_string()),
        workshop_content_dir: config
            .workshop_content_dir()
            .map(|path| path.display().to_string()),
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Config: {}", output.config);
            println!("Log: {}", output.log);
            println!("Mods dir: {}", output.mods_dir);
            println!("Overwrite dir: {}", output.overwrite_dir);
            println!("Game data: {}", output.game_data_dir);
            println!(
                "Workshop manifest: {}",
                output.workshop_manifest.as_deref().unwrap_or("-")
            );
            println!(
                "Workshop content: {}",
                output.workshop_content_dir.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn print_help() {
    println!("modroster v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modroster mods [--filter <text>]    List mods with flags and conflict state");
    println!("  modroster conflicts                 Show which mods overwrite which");
    println!("  modroster rename <position> <name>  Rename a mod and its directory");
    println!("  modroster remove <position>         Remove a mod and delete its directory");
    println!("  modroster update <name>             Query the mod's repository");
    println!("  modroster paths                     Show configured paths");
    println!();
    println!("Global options:");
    println!("  --config <path>                     Use another config file");
    println!("  --format <json|text>                Output format for list commands");
    println!("  -v, --verbose                       Debug logging");
    println!("  -h, --help                          Show help");
    println!("  -V, --version                       Show version");
}
