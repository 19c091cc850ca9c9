use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let cluster_encoder = encoder.encode_descriptor(
            "registered_clusters",
            "The number of downstream clusters in the registry",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.cluster_count() as u32).encode(cluster_encoder)?;

        let router_encoder = encoder.encode_descriptor(
            "alert_routers",
            "The number of alert-router replicas in the registry",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.alert_router_count() as u32).encode(router_encoder)?;

        Ok(())
    }
}
