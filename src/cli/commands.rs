//! Command implementations

use anyhow::{anyhow, bail, Context, Result};
use colored::Colorize;
use lpt_rs::graph::interpreter::evaluate;
use lpt_rs::graph::{Graph, Op, PartialShape};
use lpt_rs::quantization::dequantization::FakeQuantizeDequantization;
use lpt_rs::scenarios::{self, ScenarioGraph};
use lpt_rs::{LowPrecisionTransformer, LptConfig};

/// Extent used for dynamic dimensions when generating inputs.
const DYNAMIC_EXTENT: usize = 5;

pub fn run(
    name: &str,
    config_path: Option<&str>,
    shape: &str,
    passes: Option<usize>,
    samples: usize,
    dump: bool,
) -> Result<()> {
    let case = scenarios::find(name).ok_or_else(|| {
        let known: Vec<_> = scenarios::catalog().iter().map(|c| c.name).collect();
        anyhow!("unknown scenario '{}' (known: {})", name, known.join(", "))
    })?;
    let shape: PartialShape = shape.parse().context("invalid --shape")?;

    let config = match config_path {
        Some(path) => {
            println!("Loading config: {}", path.bold());
            LptConfig::from_file(path).with_context(|| format!("failed to load {path}"))?
        }
        None => case.config(),
    };
    config.validate()?;
    let max_passes = passes.unwrap_or(config.max_passes);

    println!("Scenario: {} on {}", case.name.cyan(), shape);
    let ScenarioGraph {
        mut graph,
        fake_quantizes,
        sliced_result,
        pooled_result,
        ..
    } = case.build(&shape)?;
    let original = graph.clone();
    println!("  Nodes before: {}", graph.len());
    println!();

    let transformer = LowPrecisionTransformer::from_config(&config);
    let report = transformer.run_to_fixed_point(&mut graph, max_passes)?;

    println!("{}", "Transformation".bold());
    print!("{}", report.summary());
    print!("{}", graph.validate_connectivity().summary());
    println!("  Nodes after:  {}", graph.len());
    println!();

    println!("{}", "FakeQuantize".bold());
    for &fq in &fake_quantizes {
        let node = graph.try_node(fq)?;
        if let Op::FakeQuantize(attrs) = &node.op {
            let i = &attrs.interval;
            println!(
                "  {:<10} {:<4} in [{:?}, {:?}] out [{:?}, {:?}]{}",
                node.name,
                node.precision.to_string(),
                i.input_low,
                i.input_high,
                i.output_low,
                i.output_high,
                if attrs.decomposed { "" } else { " (not decomposed)" }
            );
        }
    }
    println!();

    println!("{}", "Dequantization at results".bold());
    for (label, result) in [("sliced", sliced_result), ("pooled", pooled_result)] {
        let Some(top) = graph.input(result, 0) else {
            continue;
        };
        match FakeQuantizeDequantization::read(&graph, top) {
            Some(dq) => {
                let data = graph.try_node(dq.data)?;
                println!("  {label:<7} {} ({}) -> {}", data.name, data.precision, dq.operations);
            }
            None => println!("  {label:<7} {}", "no dequantization".yellow()),
        }
    }
    println!();

    if dump {
        dump_graph(&graph)?;
    }

    if samples > 0 {
        check_numerics(&original, &graph, samples)?;
    }
    Ok(())
}

fn dump_graph(graph: &Graph) -> Result<()> {
    println!("{}", "Graph".bold());
    for id in graph.topological_order()? {
        let node = graph.try_node(id)?;
        let inputs: Vec<String> = node.inputs().iter().map(|e| e.node.to_string()).collect();
        println!(
            "  {:>3} {:<14} {:<40} {:<4} {:<12} <- [{}]",
            id,
            node.op_type().to_string(),
            node.name,
            node.precision.to_string(),
            node.shape.to_string(),
            inputs.join(", ")
        );
    }
    println!();
    Ok(())
}

/// Evaluate both graphs on the same random inputs; the transformed graph may
/// differ by at most one quantization step.
fn check_numerics(original: &Graph, transformed: &Graph, samples: usize) -> Result<()> {
    println!("{}", "Numeric check".bold());
    let step = quantization_step(original);
    let (low, high) = input_range(original);
    let mut rng = rand::thread_rng();
    let mut worst = 0.0f32;
    for _ in 0..samples {
        let inputs = scenarios::random_inputs(original, &mut rng, (low, high), DYNAMIC_EXTENT);
        let expected = evaluate(original, &inputs)?;
        let actual = evaluate(transformed, &inputs)?;
        if expected.len() != actual.len() {
            bail!("result count changed: {} vs {}", expected.len(), actual.len());
        }
        for (e, a) in expected.iter().zip(&actual) {
            if e.shape() != a.shape() {
                bail!("result shape changed: {:?} vs {:?}", e.shape(), a.shape());
            }
            let diff = e.iter().zip(a.iter()).fold(0.0f32, |m, (x, y)| m.max((x - y).abs()));
            worst = worst.max(diff);
        }
    }
    println!("  Samples:        {samples}");
    println!("  Max abs diff:   {worst:.6}");
    println!("  One step:       {step:.6}");
    if worst <= step + 1e-5 {
        println!("{}", "✓ Outputs match within one quantization step".green());
    } else {
        println!("{}", "✗ Outputs drift beyond one quantization step".red());
    }
    Ok(())
}

fn fake_quantize_intervals(graph: &Graph) -> impl Iterator<Item = &lpt_rs::QuantizationInterval> {
    graph.nodes().filter_map(|n| match &n.op {
        Op::FakeQuantize(attrs) => Some(&attrs.interval),
        _ => None,
    })
}

fn quantization_step(graph: &Graph) -> f32 {
    fake_quantize_intervals(graph)
        .flat_map(|i| {
            let steps = (i.levels.max(2) - 1) as f32;
            i.output_low
                .iter()
                .zip(i.output_high.iter().cycle())
                .map(move |(lo, hi)| (hi - lo) / steps)
                .collect::<Vec<_>>()
        })
        .fold(0.0, f32::max)
}

fn input_range(graph: &Graph) -> (f32, f32) {
    fake_quantize_intervals(graph).fold((0.0, 1.0), |(lo, hi), i| {
        let l = i.input_low.iter().copied().fold(f32::INFINITY, f32::min);
        let h = i.input_high.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (lo.min(l), hi.max(h))
    })
}

pub fn scenarios() {
    println!("{}", "Scenarios".bold());
    for case in scenarios::catalog() {
        println!(
            "  {:<30} fq2 out [{:?}, {:?}]  slice before: {:<5}  slice after: {:<5}  per-tensor: {}",
            case.name.cyan(),
            case.fq2.output_low,
            case.fq2.output_high,
            case.ss_before,
            case.ss_after,
            case.per_tensor
        );
    }
    println!();
    println!("Shapes:");
    for shape in scenarios::shapes() {
        println!("  {shape}");
    }
}

pub fn check_config(path: &str) -> Result<()> {
    println!("Loading config: {}", path.bold());
    let config = LptConfig::from_file(path).with_context(|| format!("failed to load {path}"))?;
    config.validate()?;

    println!("✓ Config valid");
    println!("  Update precisions: {}", config.update_precisions);
    println!("  Max passes:        {}", config.max_passes);
    let rules: Vec<String> = config.rules.iter().map(|r| r.to_string()).collect();
    println!("  Rules:             {}", rules.join(", "));
    for (op, port, precisions) in config.precision_restrictions().iter() {
        let list: Vec<String> = precisions.iter().map(|p| p.to_string()).collect();
        println!("  {op}:{port} allows [{}]", list.join(", "));
    }
    for op in config.granularity_restrictions().iter() {
        println!("  {op} requires per-tensor dequantization");
    }
    Ok(())
}
