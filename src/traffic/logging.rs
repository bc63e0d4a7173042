use crate::timeq::Cycle;

pub struct TrafficLogger;

impl TrafficLogger {
    pub fn log_pattern_checkpoint(issuer: usize, pattern_name: &str, cycle: Cycle) {
        println!(
            "[TRAFFIC] issuer {} {} finished at time {:>10}",
            issuer, pattern_name, cycle
        );
    }

    pub fn log_issuer_done(issuer: usize, requests: u64) {
        println!("[TRAFFIC] issuer {} all done after {} requests", issuer, requests);
    }
}
