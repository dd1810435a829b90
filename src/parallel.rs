use crate::{config::Config, error::Result, network::Network, types::NodeId};
use rayon::prelude::*;

/// `count` forks of `network`, ready to be evaluated side by side.
#[must_use]
pub fn fork_many<C>(network: &Network<C>, count: usize) -> Vec<Network<C>>
where
    C: Config,
    C::Kernel: Clone,
    C::Buffer: Clone,
{
    (0..count).map(|_| network.fork()).collect()
}

/// Forward-propagate `root` on every network at once, one rayon task per
/// network. The networks share nothing but the evaluation clock, so this is
/// the only form of concurrency the scheduler supports.
///
/// # Errors
/// The first error any network reports; the others may or may not have
/// completed their pass.
pub fn forward_each<C>(networks: &mut [Network<C>], root: NodeId) -> Result<()>
where
    C: Config,
    Network<C>: Send,
{
    networks
        .par_iter_mut()
        .try_for_each(|network| network.forward_propagate(root))
}

/// Run `f` on every network at once and collect the results in order.
pub fn map_each<C, T, F>(networks: &mut [Network<C>], f: F) -> Vec<T>
where
    C: Config,
    Network<C>: Send,
    T: Send,
    F: Fn(&mut Network<C>) -> T + Sync + Send,
{
    networks.par_iter_mut().map(f).collect()
}
