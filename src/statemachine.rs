//! The 16-state TAP controller.  Every TCK edge moves the controller along one edge of a fixed
//! graph, selected by the TMS level.  `path` finds the shortest TMS sequence between any two
//! states; the command queue uses it to turn "go to state X" into bits on the wire.
use alloc::vec::Vec;
use alloc::vec;
use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Register {
    Data,
    Instruction,
}

impl Register {
    /// The shift state for this register
    pub fn shift_state(self) -> TapState {
        match self {
            Register::Data => TapState::ShiftDR,
            Register::Instruction => TapState::ShiftIR,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum TapState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use TapState::*;

/// `TRANSITIONS[state][tms]` is the state reached after one clock.
const TRANSITIONS: [[TapState; 2]; 16] = [
    [Idle, Reset],          // Reset
    [Idle, SelectDR],       // Idle
    [CaptureDR, SelectIR],  // SelectDR
    [ShiftDR, Exit1DR],     // CaptureDR
    [ShiftDR, Exit1DR],     // ShiftDR
    [PauseDR, UpdateDR],    // Exit1DR
    [PauseDR, Exit2DR],     // PauseDR
    [ShiftDR, UpdateDR],    // Exit2DR
    [Idle, SelectDR],       // UpdateDR
    [CaptureIR, Reset],     // SelectIR
    [ShiftIR, Exit1IR],     // CaptureIR
    [ShiftIR, Exit1IR],     // ShiftIR
    [PauseIR, UpdateIR],    // Exit1IR
    [PauseIR, Exit2IR],     // PauseIR
    [ShiftIR, UpdateIR],    // Exit2IR
    [Idle, SelectDR],       // UpdateIR
];

impl TapState {
    pub const ALL: [TapState; 16] = [
        Reset, Idle, SelectDR, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR,
        SelectIR, CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
    ];

    /// State reached after one TCK with the given TMS level
    pub fn next(self, tms: bool) -> TapState {
        TRANSITIONS[self as usize][tms as usize]
    }

    /// States the controller may be parked in between commands
    pub fn is_stable(self) -> bool {
        matches!(self, Reset | Idle | ShiftDR | PauseDR | ShiftIR | PauseIR)
    }

    /// Update states latch the shifted value into the target
    pub fn is_update(self) -> bool {
        matches!(self, UpdateDR | UpdateIR)
    }

    pub fn name(self) -> &'static str {
        match self {
            Reset => "RESET",
            Idle => "RUN/IDLE",
            SelectDR => "DRSELECT",
            CaptureDR => "DRCAPTURE",
            ShiftDR => "DRSHIFT",
            Exit1DR => "DREXIT1",
            PauseDR => "DRPAUSE",
            Exit2DR => "DREXIT2",
            UpdateDR => "DRUPDATE",
            SelectIR => "IRSELECT",
            CaptureIR => "IRCAPTURE",
            ShiftIR => "IRSHIFT",
            Exit1IR => "IREXIT1",
            PauseIR => "IRPAUSE",
            Exit2IR => "IREXIT2",
            UpdateIR => "IRUPDATE",
        }
    }
}

impl fmt::Display for TapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
struct Path {
    path: Vec<bool>,
    state: TapState,
}

/// Shortest TMS sequence leading from `from` to `to`.  Breadth-first over the transition table,
/// trying TMS low before TMS high, so the result is deterministic.  Moving to the current state
/// costs nothing.
pub fn path(from: TapState, to: TapState) -> Vec<bool> {
    if from == to {
        return Vec::new();
    }

    let mut paths = vec![Path { path: Vec::new(), state: from }];
    loop {
        let mut newpaths = Vec::new();

        for p in paths {
            for tms in [false, true] {
                let mut n = p.clone();
                n.state = p.state.next(tms);
                n.path.push(tms);

                if n.state == to {
                    return n.path;
                }
                newpaths.push(n);
            }
        }

        paths = newpaths;
    }
}

/// Apply a TMS sequence and report where the controller ends up
pub fn walk(from: TapState, tms: &[bool]) -> TapState {
    tms.iter().fold(from, |state, &bit| state.next(bit))
}

/// Whether any state visited along `tms` (excluding `from`) satisfies `f`
pub fn passes_through(from: TapState, tms: &[bool], f: impl Fn(TapState) -> bool) -> bool {
    let mut state = from;
    for &bit in tms {
        state = state.next(bit);
        if f(state) {
            return true;
        }
    }
    false
}

/// Five TMS-high clocks reach Reset from any state.
pub const RESET_SEQUENCE: [bool; 5] = [true; 5];

#[cfg(test)]
mod tests {
    use super::*;

    /// IEEE 1149.1 figure 6-1, written out edge by edge: (state, next with TMS=0, next with TMS=1)
    const IEEE_EDGES: [(TapState, TapState, TapState); 16] = [
        (Reset, Idle, Reset),
        (Idle, Idle, SelectDR),
        (SelectDR, CaptureDR, SelectIR),
        (CaptureDR, ShiftDR, Exit1DR),
        (ShiftDR, ShiftDR, Exit1DR),
        (Exit1DR, PauseDR, UpdateDR),
        (PauseDR, PauseDR, Exit2DR),
        (Exit2DR, ShiftDR, UpdateDR),
        (UpdateDR, Idle, SelectDR),
        (SelectIR, CaptureIR, Reset),
        (CaptureIR, ShiftIR, Exit1IR),
        (ShiftIR, ShiftIR, Exit1IR),
        (Exit1IR, PauseIR, UpdateIR),
        (PauseIR, PauseIR, Exit2IR),
        (Exit2IR, ShiftIR, UpdateIR),
        (UpdateIR, Idle, SelectDR),
    ];

    fn ieee_next(state: TapState, tms: bool) -> TapState {
        let (_, low, high) = IEEE_EDGES.iter().find(|e| e.0 == state).copied().unwrap();
        if tms { high } else { low }
    }

    fn ieee_walk(from: TapState, tms: &[bool]) -> TapState {
        tms.iter().fold(from, |state, &bit| ieee_next(state, bit))
    }

    fn distance(from: TapState, to: TapState) -> usize {
        // Plain BFS over the IEEE edges, independent of `path` and of the transition table
        let mut dist = [usize::MAX; 16];
        dist[from as usize] = 0;
        let mut frontier = vec![from];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for s in frontier {
                for tms in [false, true] {
                    let n = ieee_next(s, tms);
                    if dist[n as usize] == usize::MAX {
                        dist[n as usize] = dist[s as usize] + 1;
                        next.push(n);
                    }
                }
            }
            frontier = next;
        }
        dist[to as usize]
    }

    #[test]
    fn transitions_match_ieee_graph() {
        for (state, low, high) in IEEE_EDGES {
            assert_eq!(state.next(false), low, "{} tms=0", state);
            assert_eq!(state.next(true), high, "{} tms=1", state);
        }
    }

    #[test]
    fn every_pair_reaches_target_with_shortest_path() {
        for a in TapState::ALL {
            for b in TapState::ALL {
                let p = path(a, b);
                assert_eq!(ieee_walk(a, &p), b, "{} -> {}", a, b);
                let expected = if a == b { 0 } else { distance(a, b) };
                assert_eq!(p.len(), expected, "{} -> {}", a, b);
            }
        }
    }

    #[test]
    fn stable_state_moves() {
        const STABLE: [TapState; 6] = [Reset, Idle, ShiftDR, PauseDR, ShiftIR, PauseIR];
        // Rows are the starting state, columns the target, both in STABLE order
        const MOVES: [[&str; 6]; 6] = [
            ["", "0", "0100", "01010", "01100", "011010"],
            ["111", "", "100", "1010", "1100", "11010"],
            ["11111", "110", "", "10", "111100", "1111010"],
            ["11111", "110", "10", "", "111100", "1111010"],
            ["11111", "110", "11100", "111010", "", "10"],
            ["11111", "110", "11100", "111010", "10", ""],
        ];
        for (i, from) in STABLE.into_iter().enumerate() {
            for (j, to) in STABLE.into_iter().enumerate() {
                let expected: Vec<bool> = MOVES[i][j].bytes().map(|b| b == b'1').collect();
                assert_eq!(path(from, to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn canonical_paths() {
        assert_eq!(path(Reset, ShiftDR), vec![false, true, false, false]);
        assert_eq!(path(Reset, ShiftIR), vec![false, true, true, false, false]);
        assert_eq!(path(Idle, Reset), vec![true, true, true]);
        assert_eq!(path(ShiftDR, Idle), vec![true, true, false]);
        assert_eq!(path(PauseDR, ShiftDR), vec![true, false]);
        assert_eq!(path(ShiftIR, ShiftDR), vec![true, true, true, false, false]);
        assert_eq!(path(Idle, SelectDR), vec![true]);
        assert_eq!(path(PauseIR, CaptureIR), vec![true, true, true, true, false]);
        assert_eq!(path(PauseIR, CaptureDR), vec![true, true, true, false]);
    }

    #[test]
    fn reset_sequence_works_from_anywhere() {
        for s in TapState::ALL {
            assert_eq!(walk(s, &RESET_SEQUENCE), Reset);
        }
    }

    #[test]
    fn update_detection() {
        let p = path(ShiftDR, Idle);
        assert!(passes_through(ShiftDR, &p, TapState::is_update));
        let p = path(ShiftDR, PauseDR);
        assert!(!passes_through(ShiftDR, &p, TapState::is_update));
    }
}
