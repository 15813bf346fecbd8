//! `grantwell agents`: List agent types and their tools.

use grantwell_core::AgentType;
use grantwell_core::agent::CAPABILITY_MAP_VERSION;

pub fn run() {
    println!("Capability map v{CAPABILITY_MAP_VERSION}");
    println!();
    for agent in AgentType::ALL {
        println!("  {agent}");
        println!("    tools: {}", agent.capabilities().join(", "));
    }
}
