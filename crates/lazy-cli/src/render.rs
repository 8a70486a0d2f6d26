//! Renders a constructed task graph as Graphviz dot or Mermaid flowchart
//! source, without executing it (`lazy graph`). Grounded on
//! `turborepo-lib/src/engine/{dot,mermaid}.rs`: both walk a `petgraph::Graph`
//! built from the already-resolved task graph and print sorted edges so the
//! output is stable across runs.

use std::{collections::HashMap, io};

use itertools::Itertools;
use lazy_core::graph::TaskGraph;
use petgraph::{graph::Graph, visit::EdgeRef};
use rand::{distributions::Uniform, prelude::Distribution, Rng, SeedableRng};

fn build_petgraph(graph: &TaskGraph) -> Graph<String, ()> {
    let mut pg = Graph::new();
    let mut indices = HashMap::new();
    for key in graph.sorted_keys() {
        let idx = pg.add_node(key.to_string());
        indices.insert(key.clone(), idx);
    }
    for key in graph.sorted_keys() {
        let to = indices[key];
        for dep in graph.dependency_keys_of(key) {
            let from = indices[&dep];
            pg.add_edge(from, to, ());
        }
    }
    pg
}

const DOT_PRELUDE: &str = "\ndigraph {\n\tcompound = \"true\"\n\tnewrank = \"true\"\n\tsubgraph \"root\" {\n";

pub fn dot_graph<W: io::Write>(graph: &TaskGraph, mut writer: W) -> io::Result<()> {
    let pg = build_petgraph(graph);
    writer.write_all(DOT_PRELUDE.as_bytes())?;

    let mut edges = pg
        .edge_references()
        .map(|edge| {
            let source = &pg[edge.source()];
            let target = &pg[edge.target()];
            format!("\t\t\"{source}\" -> \"{target}\"")
        })
        .collect::<Vec<_>>();
    edges.sort();

    if edges.is_empty() {
        for key in graph.sorted_keys() {
            writer.write_all(format!("\t\t\"{key}\"\n").as_bytes())?;
        }
    } else {
        writer.write_all(edges.join("\n").as_bytes())?;
        writer.write_all(b"\n")?;
    }

    writer.write_all(b"\t}\n}\n\n")?;
    Ok(())
}

struct CapitalLetters;

impl Distribution<char> for CapitalLetters {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> char {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let range = Uniform::new(0u32, CHARSET.len() as u32);
        char::from_u32(CHARSET[range.sample(rng) as usize] as u32)
            .expect("charset index always in range")
    }
}

fn generate_id<R: Rng>(rng: &mut R) -> String {
    CapitalLetters.sample_iter(rng).take(4).join("")
}

pub fn mermaid_graph<W: io::Write>(graph: &TaskGraph, mut writer: W) -> io::Result<()> {
    let pg = build_petgraph(graph);
    // Fixed seed: the aliases are cosmetic, but a stable seed keeps the
    // output identical across runs for the same graph.
    let mut rng = rand::rngs::SmallRng::seed_from_u64(4u64);

    let mut edges = pg
        .edge_references()
        .map(|edge| (pg[edge.source()].clone(), pg[edge.target()].clone()))
        .collect::<Vec<_>>();
    edges.sort();

    writeln!(writer, "graph TD")?;
    let mut name_cache: HashMap<String, String> = HashMap::new();
    for (source, target) in edges {
        let source_id = name_cache
            .entry(source.clone())
            .or_insert_with(|| generate_id(&mut rng))
            .clone();
        write!(writer, "\t{source_id}(\"{source}\") --> ")?;
        let target_id = name_cache
            .entry(target.clone())
            .or_insert_with(|| generate_id(&mut rng))
            .clone();
        writeln!(writer, "{target_id}(\"{target}\")")?;
    }
    Ok(())
}
