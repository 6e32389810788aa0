// cargo run --example gather_scatter
//
// Every rank contributes one sample per owned root on rank 0. Gather
// collects all contributions per root, in (rank, leaf) order; rank 0 then
// normalizes each root's samples and scatters them back.
use star_forest::prelude::*;

fn main() -> Result<(), SfError> {
    let _ = env_logger::builder().try_init();
    let config = SfConfig {
        rank_order: true,
        ..SfConfig::default()
    };
    let results = ThreadWorld::run(3, |comm| -> Result<Vec<f64>, SfError> {
        let ctx = SfContext::initialize(config.clone());
        let mut sf = StarForest::new(&ctx, &comm)?;
        let me = comm.rank();
        let nroots = if me == 0 { 2 } else { 0 };
        sf.set_graph(nroots, 2, None, vec![SfNode::new(0, 0), SfNode::new(0, 1)])?;

        let samples = [me as f64 + 1.0, 10.0 * (me as f64 + 1.0)];
        let offsets = sf.multi_root_offsets()?;
        let mut gathered = vec![0.0f64; *offsets.last().unwrap_or(&0)];
        sf.gather_begin(Unit::scalar(), &samples, &mut gathered)?.end()?;

        for w in offsets.windows(2) {
            let slice = &mut gathered[w[0]..w[1]];
            let total: f64 = slice.iter().sum();
            if total != 0.0 {
                slice.iter_mut().for_each(|v| *v /= total);
            }
        }

        let mut shares = [0.0f64; 2];
        sf.scatter_begin(Unit::scalar(), &gathered, &mut shares)?.end()?;
        Ok(shares.to_vec())
    });

    for (rank, res) in results.into_iter().enumerate() {
        println!("rank {rank}: normalized shares {:?}", res?);
    }
    Ok(())
}
