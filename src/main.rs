use anyhow::Result;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use xtalk::cli::Args;
use xtalk::message::MidiMessage;
use xtalk::pipeline::context::PipelineContext;
use xtalk::pipeline::dispatcher::Dispatcher;
use xtalk::pipeline::ingress;
use xtalk::plugin::{build_chain, load_plugin_config};
use xtalk::transport;

fn main() -> Result<()> {
    let args = Args::parse_validated()?;

    let mut log_builder = env_logger::Builder::from_default_env();
    if args.debug {
        log_builder.filter_module("xtalk", LevelFilter::Debug);
    }
    log_builder.init();

    transport::validate_api(&args.api)?;

    if args.list {
        transport::list_ports(&args.client)?;
        return Ok(());
    }

    let output_conn = transport::open_output(&args.client, args.output.as_deref())?;
    let output_conn = Mutex::new(output_conn);
    let output: Arc<Mutex<dyn FnMut(MidiMessage) + Send>> =
        Arc::new(Mutex::new(move |msg: MidiMessage| {
            let mut conn = output_conn.lock().unwrap();
            let _ = conn.send(&msg.to_bytes());
        }));

    let plugin_config = load_plugin_config(&args.plugins_config)?;
    let plugin_names = args.plugin_names();
    let pipeline_delay_ms = args.delay;

    let ctx = Arc::new(PipelineContext::new(args)?);
    let chain = build_chain(&plugin_names, &plugin_config, pipeline_delay_ms, Arc::clone(&output))?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let input_conn = ingress::spawn(Arc::clone(&ctx), tx)?;
    let input_conn = Arc::new(Mutex::new(Some(input_conn)));
    let input_conn_for_handler = Arc::clone(&input_conn);
    let (done_tx, _done_rx) = mpsc::channel::<()>();

    ctrlc::set_handler(move || {
        warn!("Ctrl-C received, stopping pipeline..!");
        input_conn_for_handler.lock().unwrap().take();
        let _ = done_tx.send(());
    })
    .expect("Error setting Ctrl-C handler..!");

    let dispatcher = Dispatcher::new(Arc::clone(&ctx), chain, output);

    info!(
        "xtalk running on client '{}'; press Ctrl-C to stop..!",
        ctx.args.client
    );
    dispatcher.run(rx)?;
    info!("pipeline stopped, exiting..!");

    Ok(())
}
