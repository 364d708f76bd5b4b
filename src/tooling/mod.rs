use std::sync::Arc;

use crate::utils::process::Runner;

pub mod ifupdown;
pub mod pbs;
pub mod pvesh;
pub mod systemd;

pub use ifupdown::{IfupdownCli, IfupdownPort};
pub use pbs::{PbsManagerCli, PbsManagerPort};
pub use pvesh::{PveshCli, PveshPort};
pub use systemd::{SystemdCli, SystemdPort};

pub struct Toolbox {
    pvesh: Arc<dyn PveshPort>,
    pbs: Arc<dyn PbsManagerPort>,
    systemd: Arc<dyn SystemdPort>,
    ifupdown: Arc<dyn IfupdownPort>,
}

impl Toolbox {
    pub fn new(runner: Arc<dyn Runner + Send + Sync>) -> Self {
        Self {
            pvesh: Arc::new(PveshCli::new(runner.clone())),
            pbs: Arc::new(PbsManagerCli::new(runner.clone())),
            systemd: Arc::new(SystemdCli::new(runner.clone())),
            ifupdown: Arc::new(IfupdownCli::new(runner)),
        }
    }

    #[inline]
    pub fn pvesh(&self) -> Arc<dyn PveshPort> {
        self.pvesh.clone()
    }
    #[inline]
    pub fn pbs(&self) -> Arc<dyn PbsManagerPort> {
        self.pbs.clone()
    }
    #[inline]
    pub fn systemd(&self) -> Arc<dyn SystemdPort> {
        self.systemd.clone()
    }
    #[inline]
    pub fn ifupdown(&self) -> Arc<dyn IfupdownPort> {
        self.ifupdown.clone()
    }
}
