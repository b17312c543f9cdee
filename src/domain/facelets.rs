//! Corner/edge cube state and its facelet string rendering.
//!
//! The wire formats carry seven corners and eleven edges. The last piece of
//! each kind and its orientation follow from the identities
//! `sum(CP) = 28`, `sum(CO) ≡ 0 (mod 3)`, `sum(EP) = 66`, `sum(EO) ≡ 0 (mod 2)`.

use crate::error::ProtocolError;

/// Facelet indices of each corner slot (URF, UFL, ULB, UBR, DFR, DLF, DBL, DRB),
/// clockwise starting from the U/D sticker.
const CORNER_FACELETS: [[usize; 3]; 8] = [
    [8, 9, 20],
    [6, 18, 38],
    [0, 36, 47],
    [2, 45, 11],
    [29, 26, 15],
    [27, 44, 24],
    [33, 53, 42],
    [35, 17, 51],
];

/// Facelet indices of each edge slot (UR, UF, UL, UB, DR, DF, DL, DB, FR, FL, BL, BR).
const EDGE_FACELETS: [[usize; 2]; 12] = [
    [5, 10],
    [7, 19],
    [3, 37],
    [1, 46],
    [32, 16],
    [28, 25],
    [30, 43],
    [34, 52],
    [23, 12],
    [21, 41],
    [50, 39],
    [48, 14],
];

const FACES: [char; 6] = ['U', 'R', 'F', 'D', 'L', 'B'];

pub const SOLVED_FACELETS: &str =
    "UUUUUUUUURRRRRRRRRFFFFFFFFFDDDDDDDDDLLLLLLLLLBBBBBBBBB";

/// Corner/edge permutation and orientation of a 3x3 cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CornerEdgeState {
    pub cp: [u8; 8],
    pub co: [u8; 8],
    pub ep: [u8; 12],
    pub eo: [u8; 12],
}

impl CornerEdgeState {
    pub fn solved() -> Self {
        Self {
            cp: [0, 1, 2, 3, 4, 5, 6, 7],
            co: [0; 8],
            ep: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
            eo: [0; 12],
        }
    }

    /// Builds a full state from the seven corners and eleven edges carried on
    /// the wire, recovering the omitted piece of each kind arithmetically.
    pub fn from_partial(
        cp: [u8; 7],
        co: [u8; 7],
        ep: [u8; 11],
        eo: [u8; 11],
    ) -> Result<Self, ProtocolError> {
        let cp_sum: i32 = cp.iter().map(|&v| v as i32).sum();
        let co_sum: i32 = co.iter().map(|&v| v as i32).sum();
        let ep_sum: i32 = ep.iter().map(|&v| v as i32).sum();
        let eo_sum: i32 = eo.iter().map(|&v| v as i32).sum();

        let last_corner = 28 - cp_sum;
        let last_edge = 66 - ep_sum;
        if !(0..8).contains(&last_corner) {
            return Err(ProtocolError::InconsistentState(format!(
                "recovered corner index {last_corner} out of range"
            )));
        }
        if !(0..12).contains(&last_edge) {
            return Err(ProtocolError::InconsistentState(format!(
                "recovered edge index {last_edge} out of range"
            )));
        }

        let mut state = Self {
            cp: [0; 8],
            co: [0; 8],
            ep: [0; 12],
            eo: [0; 12],
        };
        state.cp[..7].copy_from_slice(&cp);
        state.cp[7] = last_corner as u8;
        state.co[..7].copy_from_slice(&co);
        state.co[7] = ((3 - co_sum % 3) % 3) as u8;
        state.ep[..11].copy_from_slice(&ep);
        state.ep[11] = last_edge as u8;
        state.eo[..11].copy_from_slice(&eo);
        state.eo[11] = ((2 - eo_sum % 2) % 2) as u8;

        state.validate()?;
        Ok(state)
    }

    /// Checks that CP/EP are permutations and orientations are in range.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !is_permutation(&self.cp) {
            return Err(ProtocolError::InconsistentState(format!(
                "corner permutation {:?} is not a permutation",
                self.cp
            )));
        }
        if !is_permutation(&self.ep) {
            return Err(ProtocolError::InconsistentState(format!(
                "edge permutation {:?} is not a permutation",
                self.ep
            )));
        }
        if self.co.iter().any(|&o| o > 2) || self.eo.iter().any(|&o| o > 1) {
            return Err(ProtocolError::InconsistentState(
                "orientation value out of range".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the state as a 54-character URFDLB facelet string.
    pub fn to_facelets(&self) -> String {
        // Centers never move, so every sticker starts as its own face.
        let mut facelets: Vec<char> = (0..54).map(|i| FACES[i / 9]).collect();

        for slot in 0..8 {
            let piece = self.cp[slot] as usize;
            let orientation = self.co[slot] as usize;
            for n in 0..3 {
                facelets[CORNER_FACELETS[slot][(n + orientation) % 3]] =
                    FACES[CORNER_FACELETS[piece][n] / 9];
            }
        }

        for slot in 0..12 {
            let piece = self.ep[slot] as usize;
            let orientation = self.eo[slot] as usize;
            for n in 0..2 {
                facelets[EDGE_FACELETS[slot][(n + orientation) % 2]] =
                    FACES[EDGE_FACELETS[piece][n] / 9];
            }
        }

        facelets.iter().collect()
    }
}

fn is_permutation(values: &[u8]) -> bool {
    let mut seen = vec![false; values.len()];
    for &v in values {
        match seen.get_mut(v as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}
