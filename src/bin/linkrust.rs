use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use linkrust_rs::config::{
    load_ontology, ConfigError, ConfigOverrides, LinkrustConfig, RepositoryOverrides,
    RunOverrides,
};
use linkrust_rs::persistence::PersistentOpenOptions;
use linkrust_rs::{
    ComparatorRegistry, EventSink, JsonLinesSink, JsonLinesSource, LinkError, Linkrust, NoMonitor, Ontology,
    PersistentStore, ReferenceBudget, ReferenceSource, ResourceMonitor, RunMode, ValidationError,
};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"linkrust - rule-driven entity resolution

USAGE:
    linkrust [OPTIONS]

OPTIONS:
    -c, --config <FILE>         Path to config file (TOML)
    -o, --ontology <FILE>       Path to ontology (JSON)
    -i, --input <FILE>          JSON-lines references [default: stdin]
        --output <FILE>         JSON-lines cluster events [default: stdout]
    -m, --mode <MODE>           merge-purge, record-linkage, identity-capture,
                                identity-resolve, identity-update, assert-ref-to-ref,
                                assert-ref-to-str, assert-str-to-str, assert-split-str
        --data-dir <DIR>        Persistent identity repository (RocksDB)
        --repair                Repair the repository before opening it
        --bypass-filter         Skip LCRD pre-filtering
        --max-references <N>    Stop after N references
        --consolidate           Run a full closure pass after the input
    -h, --help                  Print help

ENVIRONMENT:
    LINKRUST_CONFIG             Path to config file
    LINKRUST_RUN__MODE          Run mode
    LINKRUST_REPOSITORY__DATA_DIR
    RUST_LOG                    Log filter [default: info]
"#
    );
}

fn overrides() -> anyhow::Result<ConfigOverrides> {
    let mode = parse_arg("--mode")
        .or_else(|| parse_arg("-m"))
        .map(|raw| raw.parse::<RunMode>())
        .transpose()?;
    let max_references = parse_arg("--max-references")
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .map_err(|e| ConfigError {
            message: format!("invalid --max-references: {e}"),
        })?;
    let bypass_filter = has_flag("--bypass-filter").then_some(true);
    let data_dir = parse_arg("--data-dir").map(PathBuf::from);
    let repair = has_flag("--repair").then_some(true);

    let run = (mode.is_some() || bypass_filter.is_some() || max_references.is_some()).then(|| {
        RunOverrides {
            mode,
            bypass_filter,
            max_references,
        }
    });
    let repository = (data_dir.is_some() || repair.is_some()).then(|| RepositoryOverrides {
        data_dir,
        repair,
    });

    Ok(ConfigOverrides {
        run,
        repository,
        ontology: parse_arg("--ontology")
            .or_else(|| parse_arg("-o"))
            .map(PathBuf::from),
        input: parse_arg("--input").or_else(|| parse_arg("-i")).map(PathBuf::from),
        output: parse_arg("--output").map(PathBuf::from),
    })
}

fn execute() -> anyhow::Result<()> {
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("LINKRUST_CONFIG").ok())
        .map(PathBuf::from);
    let config = LinkrustConfig::load(config_path.as_deref(), overrides()?)?;

    let ontology_path = config.ontology.clone().ok_or_else(|| ConfigError {
        message: "an ontology is required (--ontology)".to_string(),
    })?;
    let spec = load_ontology(&ontology_path)?;
    let ontology = Ontology::validate(&spec, &ComparatorRegistry::default())?;

    let mut repo = match &config.repository.data_dir {
        Some(dir) => {
            let store = PersistentStore::open_with_options(
                dir,
                PersistentOpenOptions {
                    repair: config.repository.repair,
                },
            )
            .map_err(LinkError::Storage)?;
            store
                .record_ontology_config(&serde_json::to_vec(&spec)?)
                .map_err(LinkError::Storage)?;
            Linkrust::with_store(ontology, store, config.run.clone())
        }
        None => Linkrust::new(ontology, config.run.clone()),
    };

    let mut source: Box<dyn ReferenceSource> = match &config.input {
        Some(path) => {
            let file = File::open(path).map_err(|e| LinkError::Source(e.into()))?;
            Box::new(JsonLinesSource::new(
                BufReader::new(file),
                path.display().to_string(),
            ))
        }
        None => Box::new(JsonLinesSource::new(io::stdin().lock(), "stdin")),
    };
    let writer: Box<dyn Write> = match &config.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).map_err(|e| LinkError::Storage(e.into()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let mut sink = JsonLinesSink::new(writer);
    let monitor: Box<dyn ResourceMonitor> = match config.run.max_references {
        Some(limit) => Box::new(ReferenceBudget(limit)),
        None => Box::new(NoMonitor),
    };

    let summary = repo.run(source.as_mut(), &mut sink, monitor.as_ref())?;
    if has_flag("--consolidate") && summary.mode.mutates_repository() {
        let merged = repo.consolidate(&mut sink)?;
        sink.finish().map_err(LinkError::Storage)?;
        tracing::info!(merged, "consolidation complete");
    }
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<LinkError>() {
        return err.exit_code() as u8;
    }
    if err.is::<ConfigError>() || err.is::<ValidationError>() {
        return 2;
    }
    4
}

fn main() -> ExitCode {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("linkrust: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
