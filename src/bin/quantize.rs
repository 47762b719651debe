//! Model quantization tool
//!
//! Re-quantizes the weight tensors of a model file in place of their float
//! originals:
//!
//!   nibble-quantize in.nbq out.nbq --weight-dtype int4 --group-size 32 \
//!       --algo sym --scale-dtype f32 --compute-dtype fp32

use std::path::PathBuf;

use anyhow::{bail, Context};
use nibble_engine::quant::{ComputeDType, QuantAlgo, QuantizeConfig, ScaleDType, WeightDType};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nibble_engine=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let mut positional: Vec<String> = Vec::new();
    let mut cfg = QuantizeConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--weight-dtype" => {
                let v = args.next().context("--weight-dtype needs a value")?;
                cfg.weight_dtype = WeightDType::parse(&v)?;
            }
            "--group-size" => {
                let v = args.next().context("--group-size needs a value")?;
                cfg.group_size = v.parse().context("--group-size must be an integer")?;
            }
            "--algo" => {
                let v = args.next().context("--algo needs a value")?;
                cfg.algo = QuantAlgo::parse(&v)?;
            }
            "--scale-dtype" => {
                let v = args.next().context("--scale-dtype needs a value")?;
                cfg.scale_dtype = ScaleDType::parse(&v)?;
            }
            "--compute-dtype" => {
                let v = args.next().context("--compute-dtype needs a value")?;
                cfg.compute_dtype = ComputeDType::parse(&v)?;
            }
            "--help" | "-h" => {
                eprintln!(
                    "usage: nibble-quantize <input> <output> [--weight-dtype D] \
                     [--group-size N] [--algo sym|asym] [--scale-dtype D] [--compute-dtype D]"
                );
                return Ok(());
            }
            other if other.starts_with("--") => bail!("unknown flag '{other}'"),
            other => positional.push(other.to_string()),
        }
    }

    if positional.len() != 2 {
        bail!("expected <input> and <output> paths (see --help)");
    }
    let input = PathBuf::from(&positional[0]);
    let output = PathBuf::from(&positional[1]);

    let report = nibble_engine::quantize_file(&input, &output, &cfg)
        .with_context(|| format!("quantizing {}", input.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
