use std::sync::Arc;

/// Battery state of charge handed from one MPC epoch to the next.
#[derive(Debug, Clone)]
pub struct StorageState {
    dimension: usize,
    initial_soc: Arc<Vec<f64>>,
    updates: usize,
}

impl StorageState {
    pub fn new(initial_soc: Vec<f64>) -> Self {
        Self {
            dimension: initial_soc.len(),
            initial_soc: Arc::new(initial_soc),
            updates: 0,
        }
    }

    pub fn get_initial_soc(&self) -> &[f64] {
        self.initial_soc.as_slice()
    }

    pub fn shared_initial_soc(&self) -> Arc<Vec<f64>> {
        Arc::clone(&self.initial_soc)
    }

    pub fn get_updates(&self) -> usize {
        self.updates
    }

    /// Takes the first-offset SOC of an optimal solve as the next initial
    /// condition. Values of the wrong dimension are ignored.
    pub fn update_with_first_offset(&mut self, soc: Vec<f64>) -> bool {
        if soc.len() != self.dimension {
            return false;
        }
        self.initial_soc = Arc::new(soc);
        self.updates += 1;
        true
    }
}
