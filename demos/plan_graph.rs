use anyhow::Result;
use graph_alloc::{GraphPlanner, GraphView, PlanRequest, TensorDesc};

// Plan a small feed-forward block and print the resulting placements.
fn main() -> Result<()> {
    let graph = GraphView::new(
        vec![
            TensorDesc::leaf(0, 4096).with_name("input"),
            TensorDesc::leaf(1, 16384).with_name("w_up").with_external_data(),
            TensorDesc::leaf(2, 16384).with_name("w_down").with_external_data(),
        ],
        vec![
            TensorDesc::node(3, 16384, &[0, 1]).with_name("up_proj"),
            TensorDesc::node(4, 16384, &[3]).with_name("activation"),
            TensorDesc::node(5, 4096, &[4, 2]).with_name("down_proj").as_output(),
        ],
    );

    let alignments = [64usize];
    let max_chunk_sizes = [32 * 1024usize];
    let request = PlanRequest::new(&graph, 1)
        .with_alignments(&alignments)
        .with_max_chunk_sizes(&max_chunk_sizes);

    let report = GraphPlanner::new().plan(&request)?;

    println!("per-buffer totals: {:?}", report.buffer_totals);
    if let Some(splits) = &report.chunk_splits {
        println!("chunk split: {:?}", splits[0]);
    }
    println!("{}", report.to_json()?);
    Ok(())
}
