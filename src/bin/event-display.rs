//! Interactive viewer for the ADC and ToT waveforms of one crystal, event
//! by event. Only a window of the run is loaded.

use clap::Parser;
use egui_plot::{Legend, Line, Plot, PlotPoints};

use eeemcal_analysis::{
    channel_map::{ChannelMap, ConnectorLayout, ReadoutMode, GRID_SIZE, NUM_CRYSTALS},
    cli::CommonArgs,
    init_logging, load_channel_map,
    storage::read_window,
    waveform::{Event, Waveform},
};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Run number
    run: u32,
    /// Crystal (grid index) shown first
    #[arg(long, default_value_t = 12)]
    crystal: usize,
    /// First event shown
    #[arg(short, long, default_value_t = 0)]
    event: u64,
    /// Number of events loaded from `--event` on
    #[arg(long, default_value_t = 100)]
    count: usize,
    #[command(flatten)]
    common: CommonArgs,
}

struct EventViewer {
    run: u32,
    /// index of `events[0]` in the run
    first: u64,
    events: Vec<Event>,
    map: ChannelMap,
    mode: ReadoutMode,
    crystal: usize,
    current: usize,
}

impl EventViewer {
    fn lines(&self, waveforms: impl Fn(&Event) -> &[Waveform]) -> Vec<Line> {
        let Some(event) = self.events.get(self.current) else {
            return vec![];
        };
        let waveforms = waveforms(event);
        self.map
            .channels_of(self.crystal, self.mode)
            .enumerate()
            .map(|(sipm, channel)| {
                let points = waveforms[channel]
                    .0
                    .iter()
                    .enumerate()
                    .map(|(idx, &sample)| [idx as f64, sample as f64])
                    .collect::<PlotPoints>();
                Line::new(points).name(format!("sipm {sipm} (ch {channel})"))
            })
            .collect()
    }

    fn step(&mut self, forward: bool) {
        if forward && self.current + 1 < self.events.len() {
            self.current += 1;
        }
        if !forward && self.current > 0 {
            self.current -= 1;
        }
    }
}

impl eframe::App for EventViewer {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.input(|i| {
            if i.key_pressed(egui::Key::ArrowRight) {
                self.step(true);
            }
            if i.key_pressed(egui::Key::ArrowLeft) {
                self.step(false);
            }
        });

        egui::SidePanel::left("crystals").show(ctx, |ui| {
            ui.label(format!("Run {:03}", self.run));
            ui.label(format!("event {}", self.first + self.current as u64));
            egui::Grid::new("crystal_grid").show(ui, |ui| {
                for row in 0..GRID_SIZE {
                    for col in 0..GRID_SIZE {
                        let crystal = row * GRID_SIZE + col;
                        let label = self.map.display_id(crystal).to_string();
                        ui.selectable_value(&mut self.crystal, crystal, label);
                    }
                    ui.end_row();
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.style_mut().spacing.slider_width = ctx.screen_rect().width() - 300.0;
            ui.horizontal(|ui| {
                let last = self.events.len().saturating_sub(1);
                ui.add(egui::Slider::new(&mut self.current, 0..=last).step_by(1.0));
                if ui.button("<").clicked() {
                    self.step(false);
                }
                if ui.button(">").clicked() {
                    self.step(true);
                }
            });

            let height = ui.available_height() / 2.0 - 10.0;
            for (title, lines) in [
                ("ADC", self.lines(|event| event.adc.as_slice())),
                ("ToT", self.lines(|event| event.tot.as_slice())),
            ] {
                ui.label(format!("{title}, crystal {}", self.map.display_id(self.crystal)));
                Plot::new(title)
                    .legend(Legend::default())
                    .height(height)
                    .show(ui, |plot_ui| {
                        for line in lines {
                            plot_ui.line(line);
                        }
                    });
            }
        });
    }
}

fn main() -> eyre::Result<()> {
    init_logging();
    let args = Args::parse();
    let mut config = args.common.config()?;
    if args.common.layout.is_none() {
        config.layout = ConnectorLayout::Sequential;
    }
    if args.crystal >= NUM_CRYSTALS {
        eyre::bail!("crystal {} does not exist", args.crystal);
    }
    let workspace = args.common.workspace()?;
    let map = load_channel_map(&config)?;
    if args.count == 0 {
        eyre::bail!("--count must be at least 1");
    }
    let (header, events) = read_window(&workspace.run_path(&config, args.run), args.event, args.count)?;

    let viewer = EventViewer {
        run: header.run,
        first: args.event,
        events,
        map,
        mode: config.mode,
        crystal: args.crystal,
        current: 0,
    };
    eframe::run_native(
        "event display",
        eframe::NativeOptions::default(),
        Box::new(|_| Box::new(viewer)),
    )
    .map_err(|err| eyre::eyre!("event display failed: {err}"))
}
