use std::sync::Arc;

use crate::gate::GateState;
use crate::load_balancer::LoadBalancer;

// app's shared state
#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub load_balancer: Arc<LoadBalancer>,
    pub gate: GateState,
    pub max_body_bytes: usize,
}
