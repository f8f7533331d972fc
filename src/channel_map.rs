//! # Channel map
//! Translates a physical position (crystal × SiPM) into a flat electronics
//! channel through the FPGA → ASIC → connector → SiPM hierarchy:
//!
//! `channel = 144 * fpga + 72 * asic + connector_table[connector][sipm]`
//!
//! The wiring is plain constant data wrapped into an immutable [`ChannelMap`]
//! that is built once and passed to whoever needs it.

use std::fmt::Display;

use itertools::iproduct;
use serde::{Deserialize, Serialize};

use crate::error::ChannelMapError;

pub const NUM_CRYSTALS: usize = 25;
pub const GRID_SIZE: usize = 5;
pub const NUM_CHANNELS: usize = 576;

pub const CHANNELS_PER_FPGA: usize = 144;
pub const CHANNELS_PER_ASIC: usize = 72;

pub const NUM_FPGAS: u8 = 4;
pub const NUM_ASICS: u8 = 2;
pub const NUM_CONNECTORS: u8 = 4;

/// SiPM readout density of a crystal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum ReadoutMode {
    /// 16 SiPMs per crystal
    #[default]
    #[serde(rename = "16i")]
    #[value(name = "16i")]
    Interleaved16,
    /// 4 SiPMs per crystal, one per quadrant
    #[serde(rename = "4x4")]
    #[value(name = "4x4")]
    Quadrant4,
    /// a single representative SiPM per crystal
    #[serde(rename = "16p")]
    #[value(name = "16p")]
    Single,
}

impl ReadoutMode {
    pub const ALL: [ReadoutMode; 3] = [
        ReadoutMode::Interleaved16,
        ReadoutMode::Quadrant4,
        ReadoutMode::Single,
    ];

    pub fn sipms_per_crystal(self) -> usize {
        match self {
            ReadoutMode::Interleaved16 => 16,
            ReadoutMode::Quadrant4 => 4,
            ReadoutMode::Single => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReadoutMode::Interleaved16 => "16i",
            ReadoutMode::Quadrant4 => "4x4",
            ReadoutMode::Single => "16p",
        }
    }
}

impl Display for ReadoutMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Two different 16-SiPM connector tables exist for the same detector.
/// Neither is known to be authoritative, so both are kept and selected by
/// configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorLayout {
    /// SiPMs interleaved across the connector pins (energy-sum analysis)
    #[default]
    Interleaved,
    /// SiPMs on consecutive pins (ToT event display)
    Sequential,
}

/// Channel offsets inside one ASIC for each connector (A, B, C, D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorTables {
    pub sixteen: [[u8; 16]; 4],
    pub quadrant: [[u8; 4]; 4],
    pub single: [u8; 4],
}

const QUADRANT_TABLE: [[u8; 4]; 4] = [
    [0, 4, 9, 12],
    [20, 24, 27, 31],
    [58, 62, 65, 69],
    [38, 42, 48, 52],
];

const SINGLE_TABLE: [u8; 4] = [6, 26, 63, 46];

pub const INTERLEAVED_TABLES: ConnectorTables = ConnectorTables {
    sixteen: [
        [2, 6, 11, 15, 0, 4, 9, 13, 1, 5, 10, 14, 3, 7, 12, 16],
        [20, 24, 29, 33, 18, 22, 27, 31, 19, 23, 28, 32, 21, 25, 30, 34],
        [67, 63, 59, 55, 69, 65, 61, 57, 70, 66, 60, 56, 68, 64, 58, 54],
        [50, 46, 40, 36, 52, 48, 42, 38, 51, 47, 43, 39, 49, 45, 41, 37],
    ],
    quadrant: QUADRANT_TABLE,
    single: SINGLE_TABLE,
};

pub const SEQUENTIAL_TABLES: ConnectorTables = ConnectorTables {
    sixteen: [
        [0, 1, 2, 3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 14, 15, 16],
        [19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34],
        [55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70],
        [36, 37, 38, 39, 40, 41, 42, 43, 45, 46, 47, 48, 49, 50, 51, 52],
    ],
    quadrant: QUADRANT_TABLE,
    single: SINGLE_TABLE,
};

impl ConnectorTables {
    pub fn for_layout(layout: ConnectorLayout) -> Self {
        match layout {
            ConnectorLayout::Interleaved => INTERLEAVED_TABLES,
            ConnectorLayout::Sequential => SEQUENTIAL_TABLES,
        }
    }

    /// Channel offsets of one connector for the given readout mode.
    pub fn offsets(&self, connector: usize, mode: ReadoutMode) -> &[u8] {
        match mode {
            ReadoutMode::Interleaved16 => &self.sixteen[connector],
            ReadoutMode::Quadrant4 => &self.quadrant[connector],
            ReadoutMode::Single => std::slice::from_ref(&self.single[connector]),
        }
    }
}

/// Electronics address of one crystal. Mode-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CrystalAddress {
    pub fpga: u8,
    pub asic: u8,
    pub connector: u8,
}

/// Crystal wiring of one detector assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiring {
    pub fpga: [u8; NUM_CRYSTALS],
    pub asic: [u8; NUM_CRYSTALS],
    pub connector: [u8; NUM_CRYSTALS],
    /// Labels printed next to each crystal; not used for any computation.
    pub display_id: [u8; NUM_CRYSTALS],
    pub tables: ConnectorTables,
}

// FPGA IP 208..=211 -> 0..=3
const DESY_2025_FPGA: [u8; NUM_CRYSTALS] = [
    0, 3, 3, 0, 3, //
    2, 1, 1, 1, 2, //
    2, 1, 1, 1, 3, //
    2, 2, 1, 2, 3, //
    2, 0, 0, 1, 2,
];

const DESY_2025_ASIC: [u8; NUM_CRYSTALS] = [
    1, 1, 1, 0, 0, //
    1, 1, 1, 1, 1, //
    1, 0, 0, 0, 0, //
    1, 0, 1, 0, 0, //
    0, 1, 1, 0, 0,
];

// A, B, C, D -> 0..=3
const DESY_2025_CONNECTOR: [u8; NUM_CRYSTALS] = [
    2, 0, 1, 0, 1, //
    0, 2, 0, 3, 3, //
    1, 2, 0, 3, 0, //
    2, 0, 1, 1, 2, //
    3, 1, 1, 1, 2,
];

const DESY_2025_DISPLAY_ID: [u8; NUM_CRYSTALS] = [
    5, 10, 15, 20, 25, //
    4, 9, 14, 19, 24, //
    3, 8, 13, 18, 23, //
    2, 7, 12, 17, 22, //
    1, 6, 11, 16, 21,
];

impl Wiring {
    /// Wiring used at the DESY February 2025 test beam.
    ///
    /// Crystals 21 and 22 share the address (FPGA 0, ASIC 1, connector B) in
    /// the recorded tables. [`ChannelMap::collisions`] reports it.
    pub fn desy_2025(layout: ConnectorLayout) -> Self {
        Self {
            fpga: DESY_2025_FPGA,
            asic: DESY_2025_ASIC,
            connector: DESY_2025_CONNECTOR,
            display_id: DESY_2025_DISPLAY_ID,
            tables: ConnectorTables::for_layout(layout),
        }
    }
}

/// Two (crystal, sipm) pairs resolving to the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCollision {
    pub channel: usize,
    pub first: (usize, usize),
    pub second: (usize, usize),
}

impl Display for ChannelCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "channel {} claimed by crystal {} sipm {} and crystal {} sipm {}",
            self.channel, self.first.0, self.first.1, self.second.0, self.second.1
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    wiring: Wiring,
}

impl ChannelMap {
    /// Validates that every address stays inside the electronics ranges, so
    /// that all lookups afterwards are infallible.
    pub fn new(wiring: Wiring) -> Result<Self, ChannelMapError> {
        for crystal in 0..NUM_CRYSTALS {
            for (level, value, limit) in [
                ("fpga", wiring.fpga[crystal], NUM_FPGAS),
                ("asic", wiring.asic[crystal], NUM_ASICS),
                ("connector", wiring.connector[crystal], NUM_CONNECTORS),
            ] {
                if value >= limit {
                    return Err(ChannelMapError::AddressOutOfRange {
                        crystal,
                        level,
                        value,
                        limit,
                    });
                }
            }
        }

        let tables = &wiring.tables;
        let rows = tables
            .sixteen
            .iter()
            .map(|row| ("16i", &row[..]))
            .chain(tables.quadrant.iter().map(|row| ("4x4", &row[..])))
            .chain(tables.single.chunks(1).map(|row| ("16p", row)));
        for (idx, (table, row)) in rows.enumerate() {
            if let Some(&value) = row.iter().find(|&&v| v as usize >= CHANNELS_PER_ASIC) {
                return Err(ChannelMapError::OffsetOutOfRange {
                    table,
                    connector: idx % NUM_CONNECTORS as usize,
                    value,
                    limit: CHANNELS_PER_ASIC,
                });
            }
        }

        Ok(Self { wiring })
    }

    pub fn desy_2025(layout: ConnectorLayout) -> Result<Self, ChannelMapError> {
        Self::new(Wiring::desy_2025(layout))
    }

    pub fn wiring(&self) -> &Wiring {
        &self.wiring
    }

    pub fn address(&self, crystal: usize) -> CrystalAddress {
        CrystalAddress {
            fpga: self.wiring.fpga[crystal],
            asic: self.wiring.asic[crystal],
            connector: self.wiring.connector[crystal],
        }
    }

    pub fn channel_for(&self, crystal: usize, sipm: usize, mode: ReadoutMode) -> usize {
        let CrystalAddress {
            fpga,
            asic,
            connector,
        } = self.address(crystal);
        let offset = self.wiring.tables.offsets(connector as usize, mode)[sipm];

        CHANNELS_PER_FPGA * fpga as usize + CHANNELS_PER_ASIC * asic as usize + offset as usize
    }

    /// Channels of one crystal, ordered by SiPM index.
    pub fn channels_of(&self, crystal: usize, mode: ReadoutMode) -> impl Iterator<Item = usize> + '_ {
        (0..mode.sipms_per_crystal()).map(move |sipm| self.channel_for(crystal, sipm, mode))
    }

    /// Sorted, deduplicated set of channels read out in the given mode.
    pub fn active_channels(&self, mode: ReadoutMode) -> Vec<usize> {
        let mut channels = (0..NUM_CRYSTALS)
            .flat_map(|crystal| self.channels_of(crystal, mode))
            .collect::<Vec<_>>();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// Reverse lookup. Returns the first (crystal, sipm) pair owning the
    /// channel.
    pub fn locate(&self, channel: usize, mode: ReadoutMode) -> Option<(usize, usize)> {
        iproduct!(0..NUM_CRYSTALS, 0..mode.sipms_per_crystal())
            .find(|&(crystal, sipm)| self.channel_for(crystal, sipm, mode) == channel)
    }

    pub fn collisions(&self, mode: ReadoutMode) -> Vec<ChannelCollision> {
        let mut owners: Vec<Option<(usize, usize)>> = vec![None; NUM_CHANNELS];
        let mut collisions = vec![];

        for (crystal, sipm) in iproduct!(0..NUM_CRYSTALS, 0..mode.sipms_per_crystal()) {
            let channel = self.channel_for(crystal, sipm, mode);
            match owners[channel] {
                Some(first) => collisions.push(ChannelCollision {
                    channel,
                    first,
                    second: (crystal, sipm),
                }),
                None => owners[channel] = Some((crystal, sipm)),
            }
        }

        collisions
    }

    pub fn check_one_to_one(&self, mode: ReadoutMode) -> Result<(), ChannelMapError> {
        let collisions = self.collisions(mode);
        if collisions.is_empty() {
            Ok(())
        } else {
            Err(ChannelMapError::Collisions { mode, collisions })
        }
    }

    pub fn display_id(&self, crystal: usize) -> u8 {
        self.wiring.display_id[crystal]
    }

    /// (row, column) in the 5×5 grid.
    pub fn grid_position(crystal: usize) -> (usize, usize) {
        (crystal / GRID_SIZE, crystal % GRID_SIZE)
    }

    /// Inner 3×3 block of the grid.
    pub fn is_central(crystal: usize) -> bool {
        let (row, col) = Self::grid_position(crystal);
        (1..GRID_SIZE - 1).contains(&row) && (1..GRID_SIZE - 1).contains(&col)
    }

    pub fn central_crystals() -> impl Iterator<Item = usize> {
        (0..NUM_CRYSTALS).filter(|&crystal| Self::is_central(crystal))
    }
}
