use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::Body;
use exhume_mtf::catalog::CatalogNode;
use exhume_mtf::dblk::DecodeOptions;
use exhume_mtf::tree::{TreeNode, build_tree, extract};
use exhume_mtf::{MTF, index};
use log::{debug, error, info};
use serde_json::{Value, json};
use std::path::Path;

fn print_tree(nodes: &[CatalogNode], tree: &[TreeNode], depth: usize, out: &mut Vec<String>) {
    for t in tree {
        let n = &nodes[t.index];
        out.push(format!(
            "{:>6}  {}{} [{:?}]",
            t.index,
            "  ".repeat(depth),
            n.display_name(),
            n.node_type
        ));
        print_tree(nodes, &t.children, depth + 1, out);
    }
}

fn main() {
    let matches = Command::new("exhume_mtf")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Exhume the catalog and the files of a Microsoft Tape Format (.bkf) backup.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required_unless_present("index")
                .help("The path to the backup image to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw', 'ewf' or 'auto'."),
        )
        .arg(
            Arg::new("index")
                .short('i')
                .long("index")
                .value_parser(value_parser!(String))
                .help("Load the catalog from a saved index instead of scanning the backup."),
        )
        .arg(
            Arg::new("tape")
                .long("tape")
                .action(ArgAction::SetTrue)
                .help("Display the media (TAPE) header."),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List the catalog as a tree with node indices."),
        )
        .arg(
            Arg::new("node")
                .long("node")
                .value_parser(value_parser!(usize))
                .help("Display a catalog node and its descriptor block."),
        )
        .arg(
            Arg::new("block")
                .long("block")
                .value_parser(maybe_hex::<u64>)
                .help("Decode the descriptor block at this offset (decimal or hex)."),
        )
        .arg(
            Arg::new("extract")
                .long("extract")
                .value_parser(value_parser!(usize))
                .requires("dest")
                .help("Extract a volume, folder or file node (requires --dest)."),
        )
        .arg(
            Arg::new("dest")
                .long("dest")
                .value_parser(value_parser!(String))
                .help("Destination directory of --extract."),
        )
        .arg(
            Arg::new("save_index")
                .long("save-index")
                .value_parser(value_parser!(String))
                .help("Save the catalog to an index file."),
        )
        .arg(
            Arg::new("strict_checksums")
                .long("strict-checksums")
                .action(ArgAction::SetTrue)
                .help("Fail on descriptor blocks whose header checksum does not match."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output certain structures (tape, list, node, block) in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    // Initialize logger.
    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let index_path = matches.get_one::<String>("index");
    let show_tape = matches.get_flag("tape");
    let show_list = matches.get_flag("list");
    let node_id = matches.get_one::<usize>("node").copied();
    let block_offset = matches.get_one::<u64>("block").copied();
    let extract_id = matches.get_one::<usize>("extract").copied();
    let dest = matches.get_one::<String>("dest");
    let save_index = matches.get_one::<String>("save_index");
    let json_output = matches.get_flag("json");
    let options = DecodeOptions {
        strict_checksums: matches.get_flag("strict_checksums"),
        ..DecodeOptions::default()
    };

    // 1) Load the catalog index first when asked, it also names the backup.
    let mut loaded: Option<Vec<CatalogNode>> = None;
    let mut backup_path = matches.get_one::<String>("body").cloned();
    if let Some(path) = index_path {
        match index::load(path) {
            Ok((recorded, nodes)) => {
                if backup_path.is_none() {
                    backup_path = Some(recorded);
                }
                loaded = Some(nodes);
            }
            Err(e) => {
                error!("Could not load the catalog index '{}': {}", path, e);
                return;
            }
        }
    }
    let Some(file_path) = backup_path else {
        error!("No backup image given.");
        return;
    };

    // 2) Prepare the "body" and open the media.
    let body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    let mut media = match MTF::with_options(body, options.clone()) {
        Ok(m) => m,
        Err(e) => {
            error!("Couldn't open the MTF media: {}", e);
            return;
        }
    };

    if show_tape {
        if json_output {
            match serde_json::to_string_pretty(&media.tape.to_json()) {
                Ok(s) => println!("{}", s),
                Err(e) => error!("Error serializing the TAPE block to JSON: {}", e),
            }
        } else {
            println!("{}", media.tape.to_string());
        }
    }

    if let Some(offset) = block_offset {
        match media.block_at(offset) {
            Ok(block) => {
                if json_output {
                    println!("{}", block.to_json());
                } else {
                    println!("{}", block.to_string());
                }
            }
            Err(e) => error!("Could not decode the block at 0x{:X}: {}", offset, e),
        }
    }

    let needs_catalog = show_list || node_id.is_some() || extract_id.is_some() || save_index.is_some();
    if !needs_catalog {
        return;
    }

    // 3) Catalog: from the index or from a full scan.
    let nodes = match loaded {
        Some(nodes) => nodes,
        None => {
            let mut next_step = 10u64;
            let progress = |total: u64, pos: u64| {
                let percent = if total == 0 { 100 } else { pos * 100 / total };
                if percent >= next_step {
                    info!("Catalog scan: {}%", percent);
                    next_step = (percent / 10 + 1) * 10;
                }
            };
            match media.catalog(progress, || false) {
                Ok(Some(nodes)) => nodes,
                Ok(None) => {
                    info!("Catalog scan cancelled.");
                    return;
                }
                Err(e) => {
                    error!("Catalog scan failed: {}", e);
                    return;
                }
            }
        }
    };

    if let Some(path) = save_index {
        if let Err(e) = index::save(path, &file_path, &nodes) {
            error!("Could not save the catalog index: {}", e);
        }
    }

    if show_list {
        let tree = build_tree(&nodes);
        if json_output {
            let arr: Vec<Value> = nodes
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    let mut v = n.to_json();
                    v["index"] = json!(i);
                    v
                })
                .collect();
            let list_json = json!({ "nodes": arr, "tree": tree });
            match serde_json::to_string_pretty(&list_json) {
                Ok(s) => println!("{}", s),
                Err(e) => error!("Error serializing the catalog to JSON: {}", e),
            }
        } else {
            let mut lines = Vec::new();
            print_tree(&nodes, &tree, 0, &mut lines);
            for line in lines {
                println!("{}", line);
            }
        }
    }

    if let Some(id) = node_id {
        match nodes.get(id) {
            Some(node) => {
                // Nodes loaded from an index carry no block, decode it again.
                let block = match &node.block {
                    Some(b) => Ok((**b).clone()),
                    None => media.block_at(node.offset),
                };
                match block {
                    Ok(block) => {
                        if json_output {
                            let node_json = json!({ "node": node.to_json(), "block": block.to_json() });
                            println!("{}", node_json);
                        } else {
                            println!(
                                "[{}] {:?} '{}' at 0x{:X}",
                                id,
                                node.node_type,
                                node.display_name(),
                                node.offset
                            );
                            println!("{}", block.to_string());
                        }
                    }
                    Err(e) => error!("Could not decode the block of node {}: {}", id, e),
                }
            }
            None => error!("The catalog has no node {} ({} nodes).", id, nodes.len()),
        }
    }

    if let (Some(id), Some(dest)) = (extract_id, dest) {
        let reopen = || Ok(Body::new(file_path.to_owned(), format));
        match extract(&nodes, id, Path::new(dest), reopen, || false, &options) {
            Ok(Some(summary)) => println!(
                "Extracted {} file(s) and {} folder(s), {} bytes to {}",
                summary.files, summary.directories, summary.bytes, dest
            ),
            Ok(None) => info!("Extraction cancelled."),
            Err(e) => error!("Extraction failed: {}", e),
        }
    }
}
