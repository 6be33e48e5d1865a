use anyhow::Result;
use graph_alloc::{BufferOptions, GraphAllocator, GraphView, TensorDesc};

fn decode_step(context: usize) -> GraphView {
    // sizes shrink and grow with the context length while the shape of the
    // graph stays fixed, which is exactly the case the reuse path serves
    let hidden = 4096;
    GraphView::new(
        vec![TensorDesc::leaf(0, hidden).with_name("token_embedding")],
        vec![
            TensorDesc::node(1, context * 64, &[0]).with_name("attn_scores"),
            TensorDesc::node(2, hidden, &[1]).with_name("attn_out"),
            TensorDesc::node(3, hidden, &[2]).with_name("logits").as_output(),
        ],
    )
}

// Drive an orchestrator through reserve, repeated allocation, and release.
fn main() -> Result<()> {
    let mut alloc = GraphAllocator::new();
    alloc.initialize(&[BufferOptions::new(64, 1 << 24)])?;

    // size the buffers for the longest context we expect to serve
    alloc.reserve(&decode_step(2048), None, None)?;
    println!("after reserve:   {}", alloc.stats());

    // shorter contexts reuse the reservation without touching the chunks
    for context in [64, 256, 1024, 2048] {
        alloc.alloc_graph(&decode_step(context))?;
        println!(
            "context {:>5}:   committed {} bytes, attn_scores in chunk {:?}",
            context,
            alloc.committed_size(0).unwrap_or(0),
            alloc.tensor_chunk(1),
        );
    }

    alloc.release()?;
    println!("after release:   {}", alloc.stats());
    println!("{}", alloc.stats().to_json()?);
    Ok(())
}
