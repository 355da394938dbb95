use std::fs::File;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bx_core::{BundleArchive, BundleCache, Config, SignerFilter, TrustManager};
use serde_json::{json, Value};
use tracing::debug;

use crate::cli::{BxCli, BxCommand, EntriesArgs, EntryArgs, ReviseArgs, SetArgs, SignersArgs};
use crate::output::Outcome;

pub fn command_name(command: &BxCommand) -> &'static str {
    match command {
        BxCommand::Scan => "scan",
        BxCommand::Install(_) => "install",
        BxCommand::Update(_) => "update",
        BxCommand::Undo(_) => "undo",
        BxCommand::Purge(_) => "purge",
        BxCommand::Show(_) => "show",
        BxCommand::Set(_) => "set",
        BxCommand::Entries(_) => "entries",
        BxCommand::Classpath(_) => "classpath",
        BxCommand::NativeLibrary(_) => "native-library",
        BxCommand::Signers(_) => "signers",
        BxCommand::DataFile(_) => "data-file",
        BxCommand::Remove(_) => "remove",
        BxCommand::Delete => "delete",
    }
}

pub fn dispatch(cli: &BxCli) -> Outcome {
    match run(cli) {
        Ok(outcome) => outcome,
        Err(err) => Outcome::from_error(&err),
    }
}

fn run(cli: &BxCli) -> Result<Outcome> {
    let mut config = Config::from_env()?;
    if let Some(root) = &cli.cache_root {
        config = config.with_cache_root(root.clone());
    }
    debug!(root = %config.cache().path.display(), source = config.cache().source, "cache location");
    let cache = BundleCache::open(&config)?;
    match &cli.command {
        BxCommand::Scan => scan(&cache),
        BxCommand::Install(args) => install(&cache, args),
        BxCommand::Update(args) => update(&cache, args),
        BxCommand::Undo(args) => {
            let archive = cache.load(args.id)?;
            let undone = archive.undo_revise()?;
            let message = if undone {
                format!("bundle {} rolled back", args.id)
            } else {
                format!("bundle {} has a single revision; nothing to undo", args.id)
            };
            Ok(Outcome::success(message, archive_summary(&archive)?))
        }
        BxCommand::Purge(args) => {
            let archive = cache.load(args.id)?;
            archive.purge()?;
            Ok(Outcome::success(
                format!("bundle {} purged", args.id),
                archive_summary(&archive)?,
            ))
        }
        BxCommand::Show(args) => show(&cache, args.id),
        BxCommand::Set(args) => set(&cache, args),
        BxCommand::Entries(args) => entries(&cache, args),
        BxCommand::Classpath(args) => {
            let archive = cache.load(args.id)?;
            let path: Vec<String> = archive
                .current_revision()?
                .content_path()?
                .iter()
                .map(ToString::to_string)
                .collect();
            Ok(Outcome::success(
                format!("{} class path entries", path.len()),
                json!({ "id": args.id, "lines": path }),
            ))
        }
        BxCommand::NativeLibrary(args) => native_library(&cache, args),
        BxCommand::Signers(args) => signers(&cache, &config, args),
        BxCommand::DataFile(args) => {
            let path = if args.id == 0 {
                cache.system_bundle_data_file(&args.name)?
            } else {
                cache.load(args.id)?.data_file(&args.name)?
            };
            Ok(Outcome::success(
                path.display().to_string(),
                json!({ "id": args.id, "path": path }),
            ))
        }
        BxCommand::Remove(args) => {
            let archive = cache.load(args.id)?;
            cache.remove(archive)?;
            Ok(Outcome::success(
                format!("bundle {} removed", args.id),
                json!({ "id": args.id }),
            ))
        }
        BxCommand::Delete => {
            let root = cache.root().to_path_buf();
            cache.delete()?;
            Ok(Outcome::success(
                format!("deleted {}", root.display()),
                json!({ "root": root }),
            ))
        }
    }
}

fn scan(cache: &BundleCache) -> Result<Outcome> {
    let archives = cache.scan()?;
    let mut summaries = Vec::with_capacity(archives.len());
    let mut lines = Vec::with_capacity(archives.len());
    for archive in &archives {
        let summary = archive_summary(archive)?;
        lines.push(format!(
            "{:>5}  {:<11}  {}",
            archive.id()?,
            archive.state()?,
            archive.location()?
        ));
        summaries.push(summary);
    }
    Ok(Outcome::success(
        format!("{} bundles in {}", archives.len(), cache.root().display()),
        json!({ "root": cache.root(), "archives": summaries, "lines": lines }),
    ))
}

fn open_input(args: &ReviseArgs) -> Result<Option<File>> {
    args.file
        .as_ref()
        .map(|path| File::open(path).with_context(|| format!("failed to open {}", path.display())))
        .transpose()
}

fn install(cache: &BundleCache, args: &ReviseArgs) -> Result<Outcome> {
    let mut input = open_input(args)?;
    let archive = cache.create(
        args.id,
        &args.location,
        input.as_mut().map(|file| file as &mut dyn Read),
    )?;
    archive.set_last_modified(now_millis())?;
    Ok(Outcome::success(
        format!("installed bundle {}", args.id),
        archive_summary(&archive)?,
    ))
}

fn update(cache: &BundleCache, args: &ReviseArgs) -> Result<Outcome> {
    let archive = cache.load(args.id)?;
    let mut input = open_input(args)?;
    archive.revise(
        &args.location,
        input.as_mut().map(|file| file as &mut dyn Read),
    )?;
    archive.set_last_modified(now_millis())?;
    Ok(Outcome::success(
        format!("updated bundle {}", args.id),
        archive_summary(&archive)?,
    ))
}

fn show(cache: &BundleCache, id: i64) -> Result<Outcome> {
    let archive = cache.load(id)?;
    let mut details = archive_summary(&archive)?;
    let manifest = archive.current_revision()?.manifest()?;
    let headers: serde_json::Map<String, Value> = manifest
        .main()
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect();
    let lines: Vec<String> = manifest
        .main()
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect();
    details["headers"] = Value::Object(headers);
    details["lines"] = json!(lines);
    Ok(Outcome::success(
        format!("bundle {id} ({})", archive.state()?),
        details,
    ))
}

fn set(cache: &BundleCache, args: &SetArgs) -> Result<Outcome> {
    let archive = cache.load(args.id)?;
    if let Some(state) = args.state {
        archive.set_state(state.into())?;
    }
    if let Some(level) = args.start_level {
        archive.set_start_level(level)?;
    }
    if let Some(modified) = args.last_modified {
        archive.set_last_modified(modified)?;
    }
    Ok(Outcome::success(
        format!("bundle {} updated", args.id),
        archive_summary(&archive)?,
    ))
}

fn entries(cache: &BundleCache, args: &EntriesArgs) -> Result<Outcome> {
    let archive = cache.load(args.id)?;
    let revision = match args.revision {
        Some(index) => archive.revision(index)?,
        None => archive.current_revision()?,
    };
    let names = revision.content().entries().unwrap_or_default();
    Ok(Outcome::success(
        format!("{} entries in {}", names.len(), revision.content()),
        json!({ "id": args.id, "entries": names, "lines": names }),
    ))
}

fn native_library(cache: &BundleCache, args: &EntryArgs) -> Result<Outcome> {
    let archive = cache.load(args.id)?;
    let library = archive.current_revision()?.find_library(&args.name)?;
    let library = library.with_context(|| format!("no native library {} in bundle {}", args.name, args.id))?;
    Ok(Outcome::success(
        library.display().to_string(),
        json!({ "id": args.id, "path": library }),
    ))
}

fn signers(cache: &BundleCache, config: &Config, args: &SignersArgs) -> Result<Outcome> {
    let archive = cache.load(args.id)?;
    let trust = TrustManager::load(config.trusted_ca_paths())?;
    let filter = if args.all {
        SignerFilter::All
    } else {
        SignerFilter::Trusted
    };
    let chains = archive.current_revision()?.signers(&trust, filter)?;
    let lines: Vec<String> = chains
        .iter()
        .map(|chain| {
            let marker = if chain.trusted { "trusted" } else { "untrusted" };
            format!("[{marker}] {}", chain.dns.join(" <- "))
        })
        .collect();
    Ok(Outcome::success(
        format!("{} signer chains", chains.len()),
        json!({ "id": args.id, "filter": filter, "chains": *chains, "lines": lines }),
    ))
}

fn archive_summary(archive: &BundleArchive) -> Result<Value> {
    Ok(json!({
        "id": archive.id()?,
        "location": archive.location()?,
        "current_location": archive.current_location()?,
        "state": archive.state()?,
        "start_level": archive.start_level()?,
        "last_modified": archive.last_modified()?,
        "generation": archive.generation()?,
        "revisions": archive.revision_count(),
        "root": archive.root_dir(),
    }))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
