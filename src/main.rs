//! Driver binary: build, reload, and sanity-check trees from the command
//! line.
//!
//! ```text
//! ktree build     <vectors.txt> <branching-factor> <threads> [out.txt]
//! ktree build-bin <vectors.bin> <branching-factor> <threads> [out.txt]
//! ktree load      <tree.txt> <branching-factor>
//! ktree unittest
//! ```
//!
//! `build` reads ASCII vectors (one per line), `build-bin` reads the binary
//! `[u64 dims][f32 records...]` format. Both insert with a pool of worker
//! threads draining a shared cursor, each worker carrying its own arena,
//! then normalize and serialize. Exit code is zero on success and nonzero
//! on bad arguments or unreadable input.

use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use rand::Rng;

use ktree::{Arena, KTree, Vector, reader};

/// Input format for the build commands.
#[derive(Clone, Copy)]
enum InputFormat {
    Ascii,
    Binary,
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("build") => cmd_build(&args[2..], InputFormat::Ascii),
        Some("build-bin" | "build_bin") => cmd_build(&args[2..], InputFormat::Binary),
        Some("load") => cmd_load(&args[2..]),
        Some("unittest") => cmd_unittest(),
        _ => {
            usage();
            ExitCode::FAILURE
        }
    }
}

fn usage() {
    eprintln!(
        "usage: ktree build     <vectors.txt> <branching-factor> <threads> [out.txt]\n\
         \x20      ktree build-bin <vectors.bin> <branching-factor> <threads> [out.txt]\n\
         \x20      ktree load      <tree.txt> <branching-factor>\n\
         \x20      ktree unittest"
    );
}

/// Insert every vector into the tree with a pool of worker threads.
///
/// Workers claim vectors through a shared atomic cursor; each worker
/// allocates from its own arena so the allocator lock never contends.
fn insert_all<'arena>(tree: &KTree<'arena>, arenas: &'arena [Arena], vectors: &[Vector]) {
    let cursor = AtomicUsize::new(0);
    let cursor = &cursor;

    thread::scope(|scope| {
        for arena in arenas {
            scope.spawn(move || {
                loop {
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(data) = vectors.get(index) else { break };

                    tree.insert(arena, data);
                }
            });
        }
    });
}

fn cmd_build(args: &[String], format: InputFormat) -> ExitCode {
    if args.len() < 3 || args.len() > 4 {
        usage();
        return ExitCode::FAILURE;
    }

    let input = Path::new(&args[0]);
    let (Ok(branching_factor), Ok(threads)) =
        (args[1].parse::<usize>(), args[2].parse::<usize>())
    else {
        usage();
        return ExitCode::FAILURE;
    };
    if branching_factor < 2 || threads < 1 {
        usage();
        return ExitCode::FAILURE;
    }

    let loaded = match format {
        InputFormat::Ascii => reader::read_ascii_file(input),
        InputFormat::Binary => reader::read_binary_file(input),
    };
    let (dims, vectors) = match loaded {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("ktree: {}: {error}", input.display());
            return ExitCode::FAILURE;
        }
    };

    let worker_arenas: Vec<Arena> = (0..threads).map(|_| Arena::new()).collect();
    let tree_arena = Arena::new();
    let tree = KTree::new(&tree_arena, branching_factor, dims);

    insert_all(&tree, &worker_arenas, &vectors);
    tree.normalize_counts();

    let written = match args.get(3) {
        Some(out) => File::create(out).and_then(|file| {
            let mut writer = BufWriter::new(file);
            tree.serialize(&mut writer)?;
            writer.flush()
        }),
        None => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            tree.serialize(&mut writer).and_then(|()| writer.flush())
        }
    };

    if let Err(error) = written {
        eprintln!("ktree: write failed: {error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn cmd_load(args: &[String]) -> ExitCode {
    if args.len() != 2 {
        usage();
        return ExitCode::FAILURE;
    }

    let input = Path::new(&args[0]);
    let Ok(branching_factor) = args[1].parse::<usize>() else {
        usage();
        return ExitCode::FAILURE;
    };

    let text = match std::fs::read_to_string(input) {
        Ok(text) => text,
        Err(error) => {
            eprintln!("ktree: {}: {error}", input.display());
            return ExitCode::FAILURE;
        }
    };

    let arena = Arena::new();
    let tree = match KTree::deserialize_str(&arena, &text, branching_factor) {
        Ok(tree) => tree,
        Err(error) => {
            eprintln!("ktree: {}: {error}", input.display());
            return ExitCode::FAILURE;
        }
    };

    let stats = tree.stats();
    println!(
        "loaded tree: {} leaves in {} nodes, depth {}, max fanout {}",
        stats.leaf_count, stats.node_count, stats.max_leaf_depth, stats.max_fanout
    );

    ExitCode::SUCCESS
}

/// Build a small two-blob tree single-threaded and dump it, as a smoke test
/// of the whole pipeline.
fn cmd_unittest() -> ExitCode {
    const DIMS: usize = 2;
    const TOTAL_ADDS: usize = 16;

    let mut rng = rand::rng();
    let arena = Arena::new();
    let tree = KTree::new(&arena, 4, DIMS);

    for which in 0..TOTAL_ADDS {
        let mut values = [0.0f32; DIMS];
        for lane in &mut values {
            *lane = if which < TOTAL_ADDS / 2 {
                rng.random_range(0.0..2.0)
            } else {
                rng.random_range(7.0..9.0)
            };
        }
        tree.insert(&arena, &Vector::from_slice(&values));
    }

    tree.normalize_counts();

    let stats = tree.stats();
    assert_eq!(stats.leaf_count, TOTAL_ADDS, "every insert must become a leaf");
    assert_eq!(
        stats.min_leaf_depth, stats.max_leaf_depth,
        "every leaf must sit at the same depth"
    );

    print!("{}", tree.serialize_to_string());
    println!("ktree: PASS");

    ExitCode::SUCCESS
}
