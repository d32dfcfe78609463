use std::collections::BTreeSet;
use std::io::Read;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kptcond_core::prelude::*;
use kptcond_sdk::{Config, Engine, OwnershipKind, ReconcileContext, Watch, WatchScope};
use tracing::{info, warn};

const DEFAULT_MAX_PACKAGE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "kptcondctl", version, about = "Inspect conditions and reconcile plans of kpt packages")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the Kptfile condition records of a ResourceList ("-" reads stdin)
    Conditions {
        file: String,
    },
    /// Evaluate readiness of every condition whose type starts with a prefix
    Ready {
        file: String,
        /// Condition type prefix, e.g. "req.nephio.org/v1alpha1.Interface."
        #[arg(long = "prefix")]
        prefix: String,
    },
    /// Dry-run a reconcile where every for-object desires the children it already owns
    Inventory {
        file: String,
        /// For kind, e.g. "req.nephio.org/v1alpha1/Interface"
        #[arg(long = "for")]
        for_gvk: String,
        /// Owned kind with ownership, e.g. "ipam.resource.nephio.org/v1alpha1/IPClaim=remote-with-body"
        #[arg(long = "own")]
        owns: Vec<String>,
        /// Watched kind with scope, e.g. "workload.nephio.org/v1alpha1/ClusterContext=global"
        #[arg(long = "watch")]
        watches: Vec<String>,
        /// Print the reconciled ResourceList as YAML
        #[arg(long = "emit", action = ArgAction::SetTrue)]
        emit: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KPTCOND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KPTCOND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KPTCOND_METRICS_ADDR; expected host:port");
        }
    }
}

/// "v1/ConfigMap" or "group/version/Kind".
fn parse_gvk(key: &str) -> Option<Gvk> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Gvk::new(*version, *kind)),
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Some(Gvk::new(format!("{}/{}", group, version), *kind))
        }
        _ => None,
    }
}

fn parse_own(arg: &str) -> Result<(Gvk, OwnershipKind)> {
    let (key, kind) = match arg.split_once('=') {
        Some((k, v)) => (k, OwnershipKind::from_str(v)?),
        None => (arg, OwnershipKind::default()),
    };
    let gvk = parse_gvk(key).ok_or_else(|| anyhow!("invalid own kind: {}", key))?;
    Ok((gvk, kind))
}

fn parse_watch(arg: &str) -> Result<(Gvk, WatchScope)> {
    let (key, scope) = match arg.split_once('=') {
        Some((k, "global")) => (k, WatchScope::Global),
        Some((k, "scoped")) | Some((k, "for-scoped")) => (k, WatchScope::ForScoped),
        Some((_, other)) => bail!("invalid watch scope: {} (expected global|scoped)", other),
        None => (arg, WatchScope::Global),
    };
    let gvk = parse_gvk(key).ok_or_else(|| anyhow!("invalid watch kind: {}", key))?;
    Ok((gvk, scope))
}

fn max_package_bytes() -> u64 {
    std::env::var("KPTCOND_MAX_PACKAGE_BYTES").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(DEFAULT_MAX_PACKAGE_BYTES)
}

fn read_input(file: &str, limit: u64) -> Result<String> {
    let mut buf = String::new();
    if file == "-" {
        std::io::stdin().take(limit + 1).read_to_string(&mut buf).context("reading stdin")?;
    } else {
        std::fs::File::open(file)
            .with_context(|| format!("opening {}", file))?
            .take(limit + 1)
            .read_to_string(&mut buf)
            .with_context(|| format!("reading {}", file))?;
    }
    if buf.len() as u64 > limit {
        bail!("package exceeds {} bytes (KPTCOND_MAX_PACKAGE_BYTES)", limit);
    }
    Ok(buf)
}

/// YAML or JSON ResourceList; JSON parses as YAML.
fn parse_package(raw: &str) -> Result<Package> {
    let value: serde_json::Value = serde_yaml::from_str(raw).context("parsing ResourceList")?;
    let pkg: Package = serde_json::from_value(value).context("decoding ResourceList")?;
    Ok(pkg)
}

fn load(file: &str) -> Result<Package> {
    let pkg = parse_package(&read_input(file, max_package_bytes())?)?;
    info!(file, items = pkg.items.len(), "package loaded");
    Ok(pkg)
}

/// Children currently in the package that `for_obj` owns, minus those pending deletion.
fn owned_children(items: &[DynamicObject], for_obj: &DynamicObject, owns: &BTreeSet<Gvk>) -> Vec<DynamicObject> {
    let for_ref = for_obj.reference();
    let wildcard = owns.contains(&Gvk::wildcard());
    items
        .iter()
        .filter(|o| o.owner().as_ref() == Some(&for_ref))
        .filter(|o| wildcard || owns.contains(&o.gvk()))
        .filter(|o| !o.is_marked_for_deletion())
        .cloned()
        .collect()
}

fn identity_engine(for_gvk: &str, owns: &[String], watches: &[String]) -> Result<Engine> {
    let for_gvk = parse_gvk(for_gvk).ok_or_else(|| anyhow!("invalid for kind: {}", for_gvk))?;
    let mut cfg = Config::new(for_gvk);
    let mut own_set = BTreeSet::new();
    for o in owns {
        let (gvk, kind) = parse_own(o)?;
        own_set.insert(gvk.clone());
        cfg = cfg.owns(gvk, kind);
    }
    for w in watches {
        let (gvk, scope) = parse_watch(w)?;
        cfg = cfg.watch(gvk, Watch { scope, callback: None });
    }
    let cfg = cfg
        .populate(move |ctx: &ReconcileContext<'_>, for_obj: &DynamicObject| Ok(owned_children(ctx.items, for_obj, &own_set)))
        .update(|_, for_obj, _| for_obj.cloned().ok_or_else(|| anyhow!("identity update cannot generate a missing for-object")));
    Ok(Engine::new(cfg)?)
}

fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Conditions { file } => {
            let pkg = load(&file)?;
            let conditions = pkg.conditions();
            match cli.output {
                Output::Human => {
                    println!("{:<56} {:<8} {:<40} MESSAGE", "TYPE", "STATUS", "OWNER/REASON");
                    for c in conditions.iter() {
                        println!("{:<56} {:<8} {:<40} {}", c.type_, c.status.to_string(), c.reason, c.message);
                    }
                }
                Output::Json => {
                    let records: Vec<serde_json::Value> = conditions
                        .iter()
                        .map(|c| match ConditionRecord::from_wire(c) {
                            Some(rec) => serde_json::to_value(rec),
                            None => serde_json::to_value(c),
                        })
                        .collect::<Result<_, _>>()?;
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
            }
        }
        Commands::Ready { file, prefix } => {
            let pkg = load(&file)?;
            let ready = pkg.is_ready(&prefix);
            info!(prefix = %prefix, ready, "readiness evaluated");
            match cli.output {
                Output::Human => println!("{}: {}", prefix, if ready { "ready" } else { "not ready" }),
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "prefix": prefix, "ready": ready }))?),
            }
        }
        Commands::Inventory { file, for_gvk, owns, watches, emit } => {
            let mut pkg = load(&file)?;
            let engine = identity_engine(&for_gvk, &owns, &watches)?;
            let report = engine.run(&mut pkg).context("reconcile dry-run")?;
            match cli.output {
                Output::Human => {
                    println!("ready: {}", report.ready);
                    for (for_ref, d) in report.diffs.iter() {
                        let state = if d.is_empty() { "in sync" } else { "drift" };
                        println!("{} ({})", for_ref, state);
                        let lines = [
                            ("create obj", &d.create_objs),
                            ("update obj", &d.update_objs),
                            ("delete obj", &d.delete_objs),
                            ("create condition", &d.create_conditions),
                            ("delete condition", &d.delete_conditions),
                            ("clear delete marker", &d.update_delete_annotations),
                        ];
                        for (label, list) in lines {
                            for o in list.iter() {
                                println!("  {:<20} {} ({:?})", label, o.reference, o.ownership);
                            }
                        }
                        if d.delete_for_condition {
                            println!("  {:<20} {}", "delete condition", for_ref);
                        }
                    }
                    for r in report.finalized.iter() {
                        println!("finalized: {}", r);
                    }
                    for r in pkg.results.iter() {
                        eprintln!("{:?}: {}", r.severity, r.message);
                    }
                }
                Output::Json => {
                    let diffs: serde_json::Map<String, serde_json::Value> = report
                        .diffs
                        .iter()
                        .map(|(r, d)| Ok((r.to_string(), serde_json::to_value(d)?)))
                        .collect::<Result<_, serde_json::Error>>()?;
                    let out = serde_json::json!({
                        "ready": report.ready,
                        "diffs": diffs,
                        "finalized": report.finalized,
                        "removed": report.removed,
                        "results": pkg.results,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if emit {
                print!("{}", serde_yaml::to_string(&pkg)?);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kptcond_core::object::new_object;
    use kptcond_core::OWNER_ANNOTATION;

    #[test]
    fn gvk_keys_parse_with_and_without_group() {
        assert_eq!(parse_gvk("v1/ConfigMap"), Some(Gvk::new("v1", "ConfigMap")));
        assert_eq!(parse_gvk("ipam.nephio.org/v1alpha1/IPClaim"), Some(Gvk::new("ipam.nephio.org/v1alpha1", "IPClaim")));
        assert_eq!(parse_gvk("*/*"), Some(Gvk::wildcard()));
        assert_eq!(parse_gvk("ConfigMap"), None);
        assert_eq!(parse_gvk("a/b/c/d"), None);
        assert_eq!(parse_gvk("/v1/X"), None);
    }

    #[test]
    fn own_and_watch_flags_parse() {
        assert_eq!(parse_own("v1/X").unwrap(), (Gvk::new("v1", "X"), OwnershipKind::RemoteWithBody));
        assert_eq!(parse_own("v1/X=local").unwrap().1, OwnershipKind::LocalNoCondition);
        assert!(parse_own("v1/X=bogus").is_err());
        assert_eq!(parse_watch("v1/W").unwrap().1, WatchScope::Global);
        assert_eq!(parse_watch("a.dev/v1/W=scoped").unwrap(), (Gvk::new("a.dev/v1", "W"), WatchScope::ForScoped));
        assert!(parse_watch("v1/W=nearby").is_err());
    }

    #[test]
    fn owned_children_follow_owner_annotation() {
        let x = new_object("a.dev/v1", "X", "x");
        let mut mine = new_object("b.dev/v1", "C", "c1");
        mine.set_annotation(OWNER_ANNOTATION, "a.dev/v1.X.x");
        let mut other = new_object("b.dev/v1", "C", "c2");
        other.set_annotation(OWNER_ANNOTATION, "a.dev/v1.X.y");
        let unowned = new_object("b.dev/v1", "C", "c3");
        let items = vec![x.clone(), mine, other, unowned];
        let owns: BTreeSet<Gvk> = [Gvk::new("b.dev/v1", "C")].into_iter().collect();
        let got = owned_children(&items, &x, &owns);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].reference().name, "c1");
        assert!(owned_children(&items, &x, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn package_parses_from_yaml() {
        let raw = r#"
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
- apiVersion: kpt.dev/v1
  kind: Kptfile
  metadata:
    name: pkg
  status:
    conditions:
    - type: a.dev/v1.X.x
      status: "True"
- apiVersion: a.dev/v1
  kind: X
  metadata:
    name: x
"#;
        let pkg = parse_package(raw).unwrap();
        assert_eq!(pkg.items.len(), 2);
        assert!(pkg.is_ready("a.dev/v1.X."));
    }

    #[test]
    fn identity_dry_run_reports_missing_condition() {
        let mut child = new_object("b.dev/v1", "C", "c");
        child.set_annotation(OWNER_ANNOTATION, "a.dev/v1.X.x");
        let mut pkg = Package::new(vec![
            new_object(kptcond_core::kptfile::KPTFILE_API_VERSION, kptcond_core::kptfile::KPTFILE_KIND, "pkg"),
            new_object("a.dev/v1", "X", "x"),
            child,
        ]);
        let engine = identity_engine("a.dev/v1/X", &["b.dev/v1/C=remote-with-body".to_string()], &[]).unwrap();
        let report = engine.run(&mut pkg).unwrap();
        let d = &report.diffs[&Reference::new("a.dev/v1", "X", "x")];
        assert_eq!(d.create_conditions.len(), 1);
        assert!(d.create_objs.is_empty() && d.update_objs.is_empty());
    }

    #[test]
    fn oversized_input_is_rejected() {
        let dir = std::env::temp_dir().join(format!("kptcondctl-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("big.yaml");
        std::fs::write(&path, "x".repeat(64)).unwrap();
        assert!(read_input(path.to_str().unwrap(), 16).is_err());
        assert_eq!(read_input(path.to_str().unwrap(), 64).unwrap().len(), 64);
        std::fs::remove_dir_all(&dir).ok();
    }
}
