//! Shader Variant Check Binary
//!
//! Compiles and links a directory of pre-generated shader variants through the
//! shader manager, using the naga backend, and reports what each program
//! exposes.
//!
//! Files are named after their key: `<32 hex digits>.vert`, `.geom` or `.frag`.
//! The naga frontend has no geometry stage, so `.geom` files are counted and
//! skipped.
//!
//! Usage:
//!   cargo run --bin variant_check -- --dir <path>           # Check every vertex/fragment pair
//!   cargo run --bin variant_check -- --dir <path> --verbose # Also print uniform groups
//!   cargo run --bin variant_check -- --filter <hex prefix>  # Only keys starting with prefix

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ffp_shaders::{
    init_logging, DebugShaderStringType, DrawState, NagaBackend, Primitive, Result, ShaderError,
    ShaderId, ShaderManager, SourceTable, StageKind,
};

// ANSI colors for output
const ANSI_RESET: &str = "\x1b[0m";
const ANSI_RED: &str = "\x1b[31m";
const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_CYAN: &str = "\x1b[36m";
const ANSI_BOLD: &str = "\x1b[1m";

struct CheckConfig {
    dir: PathBuf,
    filter: Option<String>,
    verbose: bool,
}

/// Sources found on disk, keyed by stage
struct VariantSet {
    table: SourceTable,
    vertex: Vec<ShaderId>,
    geometry: Vec<ShaderId>,
    fragment: Vec<ShaderId>,
}

fn main() {
    init_logging();
    let config = parse_args();

    println!("{}Shader Variant Check{}", ANSI_BOLD, ANSI_RESET);
    println!("{}\n", "=".repeat(50));

    let variants = match load_variants(&config) {
        Ok(variants) => variants,
        Err(e) => {
            println!("{}Could not read {}: {}{}", ANSI_RED, config.dir.display(), e, ANSI_RESET);
            std::process::exit(2);
        }
    };
    if variants.vertex.is_empty() || variants.fragment.is_empty() {
        println!("{}No vertex/fragment variants found!{}", ANSI_YELLOW, ANSI_RESET);
        println!("Directory: {}", config.dir.display());
        return;
    }

    println!(
        "Found {} vertex, {} geometry, {} fragment variants\n",
        variants.vertex.len(),
        variants.geometry.len(),
        variants.fragment.len()
    );

    let VariantSet {
        table,
        vertex,
        geometry,
        fragment,
    } = variants;
    let mut manager = ShaderManager::new(NagaBackend::new(), table);
    let state = DrawState::default();
    if !geometry.is_empty() {
        println!(
            "{}Skipping {} geometry variant(s): not supported by the naga backend{}\n",
            ANSI_YELLOW,
            geometry.len(),
            ANSI_RESET
        );
    }

    let mut failures = 0;
    let mut fatal = false;
    for vs_id in &vertex {
        for fs_id in &fragment {
            match check_pair(&mut manager, vs_id, fs_id, &state, config.verbose) {
                Ok(()) => {}
                Err(e) => {
                    failures += 1;
                    fatal |= !e.is_recoverable();
                    println!("  {}FAIL{} {}", ANSI_RED, ANSI_RESET, e);
                }
            }
        }
    }

    print_summary(&manager);

    if failures > 0 {
        println!("\n{}{} pair(s) failed{}", ANSI_RED, failures, ANSI_RESET);
        std::process::exit(if fatal { 2 } else { 1 });
    }
}

fn check_pair(
    manager: &mut ShaderManager<NagaBackend, SourceTable>,
    vs_id: &ShaderId,
    fs_id: &ShaderId,
    state: &DrawState,
    verbose: bool,
) -> Result<()> {
    let prim = Primitive::Triangles;
    let vs = manager.apply_vertex_shader(prim, vs_id);
    let program = manager.apply_fragment_shader(vs, None, prim, fs_id, false, state)?;

    println!("  {}OK{}   {}", ANSI_GREEN, ANSI_RESET, program.key());
    if verbose {
        println!(
            "       {}attributes:{} {:?}",
            ANSI_CYAN,
            ANSI_RESET,
            program.attributes()
        );
        println!(
            "       {}uniforms:{}   {:?}",
            ANSI_CYAN,
            ANSI_RESET,
            program.available_uniforms()
        );
        let desc = manager.debug_shader_string(
            &fs_id.to_string(),
            StageKind::Fragment,
            DebugShaderStringType::ShortDesc,
        )?;
        println!("       {}fragment:{}   {}", ANSI_CYAN, ANSI_RESET, desc);
    }
    Ok(())
}

fn print_summary(manager: &ShaderManager<NagaBackend, SourceTable>) {
    let stats = manager.stats();
    println!("\n{}Summary{}", ANSI_BOLD, ANSI_RESET);
    println!("{}", "-".repeat(50));
    println!(
        "  Vertex shaders:   {} ({} failed)",
        manager.num_vertex_shaders(),
        stats.vertex.failures
    );
    println!(
        "  Geometry shaders: {} ({} failed)",
        manager.num_geometry_shaders(),
        stats.geometry.failures
    );
    println!(
        "  Fragment shaders: {} ({} failed)",
        manager.num_fragment_shaders(),
        stats.fragment.failures
    );
    println!(
        "  Programs:         {} ({} link failures)",
        manager.num_programs(),
        stats.link_failures
    );
}

fn load_variants(config: &CheckConfig) -> Result<VariantSet> {
    let mut variants = VariantSet {
        table: SourceTable::new(),
        vertex: Vec::new(),
        geometry: Vec::new(),
        fragment: Vec::new(),
    };

    for entry in fs::read_dir(&config.dir)? {
        let path = entry?.path();
        let Some((id, stage)) = classify(&path) else {
            continue;
        };
        if let Some(ref filter) = config.filter {
            if !id.to_string().starts_with(filter.as_str()) {
                continue;
            }
        }

        let source = fs::read_to_string(&path)?;
        variants.table.insert(stage, id, source);
        match stage {
            StageKind::Vertex => variants.vertex.push(id),
            StageKind::Geometry => variants.geometry.push(id),
            StageKind::Fragment => variants.fragment.push(id),
        }
    }

    variants.vertex.sort();
    variants.geometry.sort();
    variants.fragment.sort();
    Ok(variants)
}

fn classify(path: &Path) -> Option<(ShaderId, StageKind)> {
    let stage = match path.extension()?.to_str()? {
        "vert" => StageKind::Vertex,
        "geom" => StageKind::Geometry,
        "frag" => StageKind::Fragment,
        _ => return None,
    };
    let stem = path.file_stem()?.to_str()?;
    match stem.parse::<ShaderId>() {
        Ok(id) => Some((id, stage)),
        Err(ShaderError::InvalidShaderId { reason, .. }) => {
            log::warn!("Skipping {}: {}", path.display(), reason);
            None
        }
        Err(_) => None,
    }
}

fn parse_args() -> CheckConfig {
    let args: Vec<String> = env::args().collect();

    let mut dir = PathBuf::from("shaders");
    let mut filter = None;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" | "-d" => {
                i += 1;
                if i < args.len() {
                    dir = PathBuf::from(&args[i]);
                }
            }
            "--filter" | "-f" => {
                i += 1;
                if i < args.len() {
                    filter = Some(args[i].to_lowercase());
                }
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--help" | "-h" => {
                println!("Usage: variant_check [--dir <path>] [--filter <hex prefix>] [--verbose]");
                std::process::exit(0);
            }
            other => {
                println!("{}Unknown argument: {}{}", ANSI_YELLOW, other, ANSI_RESET);
            }
        }
        i += 1;
    }

    CheckConfig { dir, filter, verbose }
}
