//! Shared constants for end-to-end tests

#![allow(dead_code)]

// ============================================================================
// Promotions and divisions
// ============================================================================

pub const PROMOTION_1_ID: &str = "ufc";
pub const PROMOTION_2_ID: &str = "bellator";

pub const LIGHTWEIGHT: &str = "lightweight";
pub const WELTERWEIGHT: &str = "welterweight";

// ============================================================================
// Fighters
// ============================================================================

/// Lightweights of promotion 1
pub const FIGHTER_A: &str = "ufc-a";
pub const FIGHTER_B: &str = "ufc-b";

/// Welterweights of promotion 2
pub const FIGHTER_C: &str = "bel-c";
pub const FIGHTER_D: &str = "bel-d";
