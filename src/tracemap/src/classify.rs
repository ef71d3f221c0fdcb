/// How raw hit counts are turned into the values we report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyMode {
    /// Any hit becomes 1
    EdgesOnly,
    /// Counts bucketed into 1..=8, easy to read
    Human,
    /// Counts bucketed into single-bit flags, suitable for set operations
    Binary,
    /// Leave the counts alone
    Raw,
}

/// Bucket index for a raw count: 0, 1, 2, 3, 4-7, 8-15, 16-31, 32-127, 128-255
const fn bucket(count: usize) -> usize {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4..=7 => 4,
        8..=15 => 5,
        16..=31 => 6,
        32..=127 => 7,
        _ => 8,
    }
}

const fn build_table(values: [u8; 9]) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = values[bucket(i)];
        i += 1;
    }
    table
}

pub static COUNT_CLASS_HUMAN: [u8; 256] = build_table([0, 1, 2, 3, 4, 5, 6, 7, 8]);

pub static COUNT_CLASS_BINARY: [u8; 256] = build_table([0, 1, 2, 4, 8, 16, 32, 64, 128]);

/// Rewrite `map` in place according to `mode`
pub fn classify(map: &mut [u8], mode: ClassifyMode) {
    let table = match mode {
        ClassifyMode::Raw => return,
        ClassifyMode::EdgesOnly => {
            for b in map.iter_mut().filter(|b| **b != 0) {
                *b = 1;
            }
            return;
        }
        ClassifyMode::Human => &COUNT_CLASS_HUMAN,
        ClassifyMode::Binary => &COUNT_CLASS_BINARY,
    };

    for b in map.iter_mut() {
        *b = table[*b as usize];
    }
}
