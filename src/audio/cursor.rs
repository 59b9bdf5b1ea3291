use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};

/// Política de avance del cursor cuando termina una canción
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    Off,
    /// Repetir la canción actual
    Song,
    /// Volver al inicio al terminar la cola
    Queue,
}

impl LoopMode {
    /// Siguiente modo en el ciclo Off → Song → Queue → Off
    pub fn cycle(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Song,
            LoopMode::Song => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Off => write!(f, "off"),
            LoopMode::Song => write!(f, "song"),
            LoopMode::Queue => write!(f, "queue"),
        }
    }
}

/// Siguiente índice en orden secuencial, o `None` si la cola terminó
pub fn next_index(index: usize, len: usize, mode: LoopMode) -> Option<usize> {
    match mode {
        LoopMode::Song => (index < len).then_some(index),
        LoopMode::Queue => (len > 0).then(|| (index + 1) % len),
        LoopMode::Off => (index + 1 < len).then_some(index + 1),
    }
}

/// Entradas ya tocadas en la ronda actual de shuffle.
///
/// Las entradas se identifican por una clave estable (no por posición) para
/// que agregar o quitar canciones no desordene la ronda.
#[derive(Debug, Default)]
pub(crate) struct ShufflePool {
    played: HashSet<u64>,
}

impl ShufflePool {
    pub fn mark_played(&mut self, key: u64) {
        self.played.insert(key);
    }

    pub fn forget(&mut self, key: u64) {
        self.played.remove(&key);
    }

    pub fn reset(&mut self) {
        self.played.clear();
    }

    /// Elige al azar una entrada no tocada en esta ronda.
    ///
    /// Con `LoopMode::Queue` la ronda se reinicia al agotarse, evitando
    /// repetir `current` si hay otra opción.
    pub fn next<R: Rng + ?Sized>(
        &mut self,
        keys: &[u64],
        current: Option<u64>,
        mode: LoopMode,
        rng: &mut R,
    ) -> Option<usize> {
        let remaining: Vec<usize> = (0..keys.len())
            .filter(|&i| !self.played.contains(&keys[i]))
            .collect();

        if let Some(&pick) = remaining.choose(rng) {
            return Some(pick);
        }

        if mode != LoopMode::Queue || keys.is_empty() {
            return None;
        }

        self.played.clear();
        let fresh: Vec<usize> = (0..keys.len())
            .filter(|&i| keys.len() == 1 || Some(keys[i]) != current)
            .collect();
        fresh.choose(rng).copied()
    }
}
