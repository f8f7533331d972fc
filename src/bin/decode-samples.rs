//! Prints the ToA- and ToT-marked samples of every channel of one event.

use clap::Parser;
use log::warn;

use eeemcal_analysis::{
    channel_map::NUM_CRYSTALS,
    cli::CommonArgs,
    init_logging, load_channel_map,
    storage::read_event,
    waveform::{decode_marked_sample, MarkedSample},
};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Run number
    run: u32,
    /// Event index within the run
    #[arg(short, long, default_value_t = 0)]
    event: u64,
    /// Only this crystal (grid index)
    #[arg(long)]
    crystal: Option<usize>,
    #[command(flatten)]
    common: CommonArgs,
}

fn format_marked(marked: Option<MarkedSample>) -> String {
    match marked {
        Some(MarkedSample { sample, marks, amplitude }) => format!("{sample}\t{marks}\t{amplitude}"),
        None => "-\t-\t-".to_owned(),
    }
}

fn main() -> eyre::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.config()?;
    let workspace = args.common.workspace()?;
    let map = load_channel_map(&config)?;

    let event = read_event(&workspace.run_path(&config, args.run), args.event)?;
    if event.toa.is_none() {
        warn!("run {:03} carries no ToA waveforms", args.run);
    }

    let crystals = match args.crystal {
        Some(crystal) if crystal < NUM_CRYSTALS => crystal..crystal + 1,
        Some(crystal) => eyre::bail!("crystal {crystal} does not exist"),
        None => 0..NUM_CRYSTALS,
    };

    println!("crystal\tsipm\tchannel\ttoa_sample\ttoa_marks\ttoa_amp\ttot_sample\ttot_marks\ttot_amp");
    for crystal in crystals {
        let display_id = map.display_id(crystal);
        for (sipm, channel) in map.channels_of(crystal, config.mode).enumerate() {
            let adc = &event.adc[channel];
            let toa = event.toa.as_ref().map(|toa| decode_marked_sample(adc, &toa[channel]));
            let tot = decode_marked_sample(adc, &event.tot[channel]);
            for (name, marked) in [("ToA", toa), ("ToT", Some(tot))] {
                if let Some(marked) = marked.filter(|marked| marked.marks > 1) {
                    warn!(
                        "channel {channel}: {name} marked at {} samples, using sample {}",
                        marked.marks, marked.sample
                    );
                }
            }
            println!(
                "{display_id}\t{sipm}\t{channel}\t{}\t{}",
                format_marked(toa),
                format_marked(Some(tot))
            );
        }
    }

    Ok(())
}
