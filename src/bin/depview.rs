extern crate dependency_viewer;

use anyhow::Context;
use clap::Parser;
use fs_err as fs;
use std::path::PathBuf;

use dependency_viewer::executable::DependencyKind;
use dependency_viewer::imports::ImportResolution;
use dependency_viewer::models::{
    sorted_exports, sorted_imports, ExportColumn, ImportColumn, ModuleTree, ModuleTreeNode,
};
use dependency_viewer::{decanonicalize, logging, path_to_string};
use dependency_viewer::{
    AbsolutePathCanonicalizer, Analysis, CheckReport, LookupQuery, ModuleStatus, UnresolvedReason,
};

/// ldd for PE binaries, with imports, exports, forwarders and resources
#[derive(Parser, Debug)]
#[command(name = "depview", version, about)]
struct Cli {
    /// Binaries to analyze (glob patterns are expanded)
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<String>,

    /// Working directory to be considered in the DLL lookup path (default: directory of the first input)
    #[arg(short = 'k', long = "workdir", value_name = "WORKDIR")]
    workdir: Option<PathBuf>,

    /// Additional directories to search, separated by ';'
    #[arg(short = 'a', long = "userpath", value_name = "PATH")]
    userpath: Option<String>,

    /// Decode the resource tree of every module
    #[arg(long = "resources")]
    resources: bool,

    /// Do not attach demangled names to decorated exports
    #[arg(long = "no-demangle")]
    no_demangle: bool,

    /// Do not locate the modules named by forwarder exports
    #[arg(long = "no-forwarders")]
    no_forwarders: bool,

    /// List the imports and exports of every analyzed module
    #[arg(short = 's', long = "symbols")]
    symbols: bool,

    /// Report missing modules and imports not satisfied by any export
    #[arg(short = 'c', long = "check-symbols")]
    check_symbols: bool,

    /// Write the whole analysis as JSON to this file
    #[arg(short = 'j', long = "output-json-path", value_name = "OUTPUT_JSON_PATH")]
    output_json_path: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

// a pattern without matches is kept as is, so that it shows up as a missing root
fn expand_inputs(inputs: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    for input in inputs {
        let matches = glob::glob(input)
            .with_context(|| format!("invalid input pattern {input}"))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("could not expand {input}"))?;
        if matches.is_empty() {
            roots.push(PathBuf::from(input));
        } else {
            roots.extend(matches);
        }
    }
    Ok(roots)
}

fn folder_of(analysis: &Analysis, module: usize) -> Option<String> {
    let path = analysis.str(analysis.modules[module].path?);
    let folder = std::path::Path::new(path).parent()?;
    Some(decanonicalize(&path_to_string(folder)))
}

fn print_row(analysis: &Analysis, node: &ModuleTreeNode) {
    let tabs = "\t".repeat(node.depth);
    let name = analysis.display_name(node.module);
    let module = &analysis.modules[node.module];
    let kind = match node.kind {
        Some(DependencyKind::Delayed) => " [delay-load]",
        Some(DependencyKind::Forwarded) => " [forwarded]",
        _ => "",
    };
    let location = match &module.status {
        ModuleStatus::Unresolved(UnresolvedReason::NotFound) => "not found".to_owned(),
        ModuleStatus::Unresolved(reason) => {
            let folder = folder_of(analysis, node.module).unwrap_or_default();
            format!("{folder} (could not be analyzed: {reason:?})")
        }
        _ => folder_of(analysis, node.module).unwrap_or_default(),
    };
    let repeated = if node.original.is_some() { " (see above)" } else { "" };
    println!("{tabs}{name} => {location}{kind}{repeated}");
}

fn resolution_tag(analysis: &Analysis, resolution: &ImportResolution) -> String {
    match resolution {
        ImportResolution::Matched { .. } => String::new(),
        ImportResolution::Forwarded { target: Some(t), .. } => match analysis.get_by_key(t.module) {
            Some(m) => format!(" (forwarded to {})", analysis.display_name(m)),
            None => " (forwarded)".to_owned(),
        },
        ImportResolution::Forwarded { target: None, .. } => " (forwarded, chain broken)".to_owned(),
        ImportResolution::Unmatched => " (not found)".to_owned(),
        ImportResolution::ModuleUnavailable => " (module unavailable)".to_owned(),
        ImportResolution::Pending => " (not matched)".to_owned(),
    }
}

fn print_symbols(analysis: &Analysis) {
    for index in analysis.sorted_by_first_appearance() {
        let module = &analysis.modules[index];
        if !module.is_analyzed() {
            continue;
        }
        println!("{}", analysis.display_name(index));
        for imported in &module.imports.modules {
            println!("\timports from {}", analysis.str(imported.name));
            for i in sorted_imports(analysis, &imported.symbols, ImportColumn::Name) {
                let symbol = &imported.symbols[i];
                println!(
                    "\t\t{}{}",
                    analysis.symbol_label(&symbol.target),
                    resolution_tag(analysis, &symbol.resolution)
                );
            }
        }
        if !module.exports.is_empty() {
            println!("\texports");
        }
        let entries = &module.exports.entries;
        for i in sorted_exports(analysis, entries, ExportColumn::Ordinal) {
            let export = &entries[i];
            let name = export.name.map_or("-", |n| analysis.str(n));
            let used = if export.used { " [used]" } else { "" };
            println!(
                "\t\t{:>5} {} {}{}",
                export.ordinal,
                export.debug_name.as_deref().unwrap_or(name),
                analysis.export_address_label(&export.address),
                used
            );
        }
    }
}

fn write_json(path: &std::path::Path, analysis: &Analysis) -> anyhow::Result<()> {
    let shown = path.display();
    let file = fs::File::create(path).with_context(|| format!("couldn't create {shown}"))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), analysis)
        .with_context(|| format!("couldn't write to {shown}"))?;
    tracing::info!("successfully wrote to {}", shown);
    Ok(())
}

fn print_report(report: &CheckReport) {
    for root in &report.unresolved_roots {
        println!("Could not analyze input {root}");
    }

    if !report.unresolved_modules.is_empty() {
        println!("Missing libraries detected!");
        println!("[Importing executable, missing dependencies]\n");
        for (importer, missing) in &report.unresolved_modules {
            println!("{importer}");
            for dll in missing {
                println!("\t{dll}");
            }
        }
        println!();
    } else {
        println!("No missing libraries detected");
    }

    if !report.not_found_symbols.is_empty() {
        println!("\nMissing symbols detected!");
        println!("[Importing executable, exporting executable, missing symbols]\n");
        for (importer, per_exporter) in &report.not_found_symbols {
            println!("{importer}");
            for (exporter, symbols) in per_exporter {
                println!("\t{exporter}");
                for symbol in symbols {
                    let shown = dependency_viewer::exports::demangle_symbol(symbol);
                    println!("\t\t{}", shown.as_deref().unwrap_or(symbol));
                }
            }
        }
    } else {
        println!("No missing symbols detected");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_tracing(cli.verbose);

    let roots = expand_inputs(&cli.inputs)?;
    let mut query = LookupQuery::deduce_from_executable_locations(roots.as_slice())?;

    query.parameters.decode_resources = cli.resources;
    query.parameters.demangle_exports = !cli.no_demangle;
    query.parameters.follow_forwarders = !cli.no_forwarders;

    if let Some(workdir) = &cli.workdir {
        query.working_dir = workdir.clone();
    } else {
        tracing::info!(
            "Working directory not specified, assuming directory of the first input: {}",
            path_to_string(&query.working_dir)
        );
    }

    if let Some(user_path) = &cli.userpath {
        for entry in user_path.split(';').filter(|s| !s.is_empty()) {
            let p = std::path::Path::new(entry);
            if p.is_dir() {
                query.user_path.push(fs::canonicalize(p)?);
            } else {
                tracing::warn!("Skipping non-existing path entry {}", entry);
            }
        }
    }

    let canonicalizer = AbsolutePathCanonicalizer::from_current_dir()?;
    let analysis = dependency_viewer::lookup(&query, &canonicalizer)?;

    // printing depth-first
    println!();
    let tree = ModuleTree::new(&analysis);
    tree.visit_depth_first(|node| print_row(&analysis, node));

    if cli.check_symbols {
        println!("\nChecking symbols...\n");
        print_report(&analysis.check());
    }

    if cli.symbols {
        println!();
        print_symbols(&analysis);
    }

    if let Some(json_output_path) = &cli.output_json_path {
        write_json(json_output_path, &analysis)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_patterns_are_kept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.exe"), b"")?;
        fs::write(dir.path().join("b.exe"), b"")?;
        let pattern = format!("{}/*.exe", dir.path().display());
        let missing = format!("{}/missing.dll", dir.path().display());
        let roots = expand_inputs(&[pattern, missing.clone()])?;
        assert_eq!(
            roots,
            vec![dir.path().join("a.exe"), dir.path().join("b.exe"), PathBuf::from(missing)]
        );
        Ok(())
    }

    #[test]
    fn json_dump_of_a_run() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("broken.exe");
        fs::write(&root, b"MZ")?;
        let query = LookupQuery::deduce_from_executable_locations(&[root])?;
        let analysis =
            dependency_viewer::lookup(&query, &AbsolutePathCanonicalizer::new(dir.path()))?;
        assert!(matches!(
            analysis.modules[0].status,
            ModuleStatus::Unresolved(UnresolvedReason::BadFormat(_))
        ));

        let out = dir.path().join("out.json");
        write_json(&out, &analysis)?;
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out)?)?;
        assert_eq!(value["modules"].as_array().map(Vec::len), Some(1));
        assert!(value["strings"]
            .as_array()
            .map_or(false, |s| s.iter().any(|v| v == "broken.exe")));

        assert!(write_json(&dir.path().join("no/such/dir/out.json"), &analysis).is_err());
        Ok(())
    }
}
