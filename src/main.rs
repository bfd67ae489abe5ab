// main.rs - 训练入口
//
// 用法: backgammon-az-train <实验目录> [--resume]
// 目录中已有 config.json 时从中读取配置, 否则使用默认值。
// 干净退出返回 0, 致命配置错误返回非零。

use std::env;
use std::process;

use anyhow::{bail, Context, Result};

use backgammon_az::supervisor::alpha_zero;
use backgammon_az::{AlphaZeroConfig, StopToken};

fn run() -> Result<()> {
    let mut path: Option<String> = None;
    let mut resume = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--resume" => resume = true,
            other if path.is_none() => path = Some(other.to_string()),
            other => bail!("unexpected argument: {}", other),
        }
    }
    let Some(path) = path else {
        bail!("usage: backgammon-az-train <path> [--resume]");
    };

    let config_path = std::path::Path::new(&path).join("config.json");
    let mut config = if config_path.exists() {
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {:?}", config_path))?;
        serde_json::from_str::<AlphaZeroConfig>(&text).context("parse config.json")?
    } else {
        AlphaZeroConfig::default()
    };
    config.path = path;

    alpha_zero(config, StopToken::new(), resume)
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Fatal: {:#}", err);
        process::exit(1);
    }
}
