// supervisor.rs - 训练管线装配
//
// 解析配置 -> 建模型副本 -> 同步检查点 -> 起 actor / evaluator 线程
// -> 在当前线程跑学习循环 -> 停止令牌 -> 排空队列 -> 汇合所有线程。

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{ensure, Context, Result};
use tch::Device;

use crate::config::AlphaZeroConfig;
use crate::device::DeviceManager;
use crate::evaluation::{run_evaluator, EvalResults};
use crate::game_env::{BackgammonGame, ScoringType};
use crate::inference::VNetEvaluator;
use crate::learner::run_learner;
use crate::nn_model::{configure_backend, ModelConfig, VNetModel};
use crate::queue::{StopToken, ThreadedQueue};
use crate::self_play::{run_actor, Trajectory};
use crate::training_log::{read_start_info, StartInfo};

const GRAPH_DEF: &str = "vpnet.pb";

/// 跑完一次完整训练 (或直到停止令牌触发)。
/// 配置错误在任何线程启动之前返回。
pub fn alpha_zero(config: AlphaZeroConfig, stop: StopToken, resuming: bool) -> Result<()> {
    config.validate()?;

    let scoring_type = ScoringType::parse(&config.scoring_type)?;
    let game = BackgammonGame::new(&config.game, scoring_type, config.randomized_openings)?;

    let path = Path::new(&config.path).to_path_buf();
    fs::create_dir_all(&path).with_context(|| format!("create {:?}", path))?;
    ensure!(path.is_dir(), "{:?} is not a directory", path);
    println!("Logging directory: {}", path.display());

    // 模型结构描述: 供所有进程/副本重建同一拓扑
    let model_config = ModelConfig {
        observation_shape: game.observation_shape(),
        nn_depth: config.nn_depth,
        nn_width: config.nn_width,
        learning_rate: config.learning_rate,
        weight_decay: config.weight_decay,
        nn_model: config.nn_model.clone(),
    };
    let model_path = path.join(GRAPH_DEF);
    if model_path.exists() {
        println!("Overwriting existing model: {}", model_path.display());
    } else {
        println!("Creating model: {}", model_path.display());
    }
    model_config.save(&model_path)?;

    println!("Playing game: {}", config.game);

    // 批量与线程数夹取到有意义的范围
    let mut config = config;
    config.inference_batch_size = config
        .inference_batch_size
        .clamp(1, (config.actors + config.evaluators).max(1));
    config.inference_threads = config
        .inference_threads
        .clamp(1, ((1 + config.actors + config.evaluators) / 2).max(1));

    {
        let file = fs::File::create(path.join("config.json"))?;
        serde_json::to_writer_pretty(file, &config).context("write config.json")?;
    }

    let start_info = if resuming {
        read_start_info(&path)?
    } else {
        StartInfo::fresh()
    };

    // 设备副本: 第一个为学习设备, 另备一个纯 CPU 池给无批量推理用
    let device_list = config.device_list()?;
    configure_backend(&device_list);

    let mut device_manager = DeviceManager::new();
    for device in &device_list {
        device_manager.add_device(VNetModel::new(&path, GRAPH_DEF, *device)?);
    }
    ensure!(device_manager.count() > 0, "no devices specified");

    let mut cpu_device_manager = DeviceManager::new();
    cpu_device_manager.add_device(VNetModel::new(&path, GRAPH_DEF, Device::Cpu)?);

    // 所有副本从同一个检查点出发
    let checkpoint_step = if resuming {
        crate::nn_model::MOST_RECENT_CHECKPOINT_STEP
    } else {
        device_manager.loan(0).save_checkpoint(0)?;
        0
    };
    eprintln!("Loading model from step {}", checkpoint_step);
    for i in 0..device_manager.count() {
        device_manager.loan(i).load_checkpoint(checkpoint_step)?;
    }
    for i in 0..cpu_device_manager.count() {
        cpu_device_manager.loan(i).load_checkpoint(checkpoint_step)?;
    }

    let device_manager = Arc::new(device_manager);
    let cpu_device_manager = Arc::new(cpu_device_manager);

    let cache_shards = ((config.actors + config.evaluators) / 16).max(1);
    let eval = Arc::new(VNetEvaluator::new(
        device_manager.clone(),
        config.inference_batch_size,
        config.inference_cache,
        cache_shards,
        stop.clone(),
    ));
    eval.start_runners(config.inference_threads);

    // 无批量的 GPU 推理比 CPU 还慢, 这种配置下 actor/evaluator 用 CPU 池
    let use_cpu_only_inference =
        config.inference_batch_size <= 1 && device_list[0] != Device::Cpu;
    if use_cpu_only_inference {
        eprintln!("Using cpu_only inference for actors/evaluators.");
    }
    let inf_eval = if use_cpu_only_inference {
        let e = Arc::new(VNetEvaluator::new(
            cpu_device_manager.clone(),
            config.inference_batch_size,
            config.inference_cache,
            cache_shards,
            stop.clone(),
        ));
        e.start_runners(config.inference_threads);
        e
    } else {
        eval.clone()
    };

    let trajectory_queue = Arc::new(ThreadedQueue::<Trajectory>::new(
        (config.replay_buffer_size / config.replay_buffer_reuse).max(1),
    ));
    let eval_results = Arc::new(EvalResults::new(config.eval_levels, config.evaluation_window));

    // actor / evaluator 线程
    let config = Arc::new(config);
    let mut actor_handles = Vec::with_capacity(config.actors);
    for i in 0..config.actors {
        let game = game.clone();
        let config = config.clone();
        let queue = trajectory_queue.clone();
        let evaluator: Arc<dyn crate::mcts::Evaluator> = inf_eval.clone();
        let stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("actor-{}", i))
            .spawn(move || run_actor(&game, &config, i, &queue, evaluator, &stop))
            .context("spawn actor thread")?;
        actor_handles.push(handle);
    }

    let mut evaluator_handles = Vec::with_capacity(config.evaluators);
    for i in 0..config.evaluators {
        let game = game.clone();
        let config = config.clone();
        let results = eval_results.clone();
        let evaluator: Arc<dyn crate::mcts::Evaluator> = inf_eval.clone();
        let stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("evaluator-{}", i))
            .spawn(move || run_evaluator(&game, &config, i, &results, evaluator, &stop))
            .context("spawn evaluator thread")?;
        evaluator_handles.push(handle);
    }

    // 学习循环跑在当前线程
    let learner_result = run_learner(
        &game,
        &config,
        &device_manager,
        &cpu_device_manager,
        &eval,
        if use_cpu_only_inference { Some(&*inf_eval) } else { None },
        &trajectory_queue,
        &eval_results,
        &stop,
        start_info,
        false,
    );

    if !stop.stop_requested() {
        stop.stop();
    }

    // 排空队列让 actor 退出, 然后汇合所有线程
    trajectory_queue.block_new_values();
    trajectory_queue.clear();

    println!("Joining all the threads.");
    for handle in actor_handles {
        let _ = handle.join();
    }
    for handle in evaluator_handles {
        let _ = handle.join();
    }
    eval.shutdown();
    if use_cpu_only_inference {
        inf_eval.shutdown();
    }
    println!("Exiting cleanly.");

    learner_result
}
