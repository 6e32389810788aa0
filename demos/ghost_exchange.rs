// cargo run --example ghost_exchange
//
// A 1-D grid of 20 cells split over 4 ranks. Each rank owns 5 cells and
// keeps one ghost copy of each neighbor's boundary cell. A broadcast fills
// the ghosts from their owners; a sum-reduction sends ghost corrections
// back and accumulates them on the owners.
use star_forest::prelude::*;

const OWNED: usize = 5;

fn main() -> Result<(), SfError> {
    let _ = env_logger::builder().try_init();
    let results = ThreadWorld::run(4, |comm| -> Result<(Vec<f64>, Vec<f64>), SfError> {
        let ctx = SfContext::from_env()?;
        let mut sf = StarForest::new(&ctx, &comm)?;
        let (me, size) = (comm.rank(), comm.size());

        // leaf slots: 0 = left ghost, 1 = right ghost
        let mut slots = Vec::new();
        let mut ghosts = Vec::new();
        if me > 0 {
            slots.push(0);
            ghosts.push(SfNode::new(me - 1, OWNED - 1));
        }
        if me + 1 < size {
            slots.push(1);
            ghosts.push(SfNode::new(me + 1, 0));
        }
        sf.set_graph(OWNED, ghosts.len(), Some(slots.into()), ghosts)?;

        let owned: Vec<f64> = (0..OWNED).map(|i| (me * OWNED + i) as f64).collect();
        let mut halo = [f64::NAN; 2];
        let req = sf.bcast_begin(Unit::scalar(), &owned, &mut halo, ReduceOp::Replace)?;
        // interior work would overlap with the exchange here
        req.end()?;

        // every ghost sends back a unit correction
        let corrections = [1.0f64; 2];
        let mut fluxes = vec![0.0f64; OWNED];
        sf.reduce(Unit::scalar(), &corrections, &mut fluxes, ReduceOp::Sum)?;
        Ok((halo.to_vec(), fluxes))
    });

    for (rank, res) in results.into_iter().enumerate() {
        let (halo, fluxes) = res?;
        println!("rank {rank}: ghosts {halo:?}, boundary fluxes {fluxes:?}");
    }
    Ok(())
}
