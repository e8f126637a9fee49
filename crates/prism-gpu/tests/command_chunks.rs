use prism_gpu::cs::{ChunkTag, CsChunk, CsCmd, CHUNK_CAPACITY};

#[test]
fn chunks_preserve_append_order() {
    let mut chunk = CsChunk::new(ChunkTag::SingleUse);
    for i in 0..10 {
        chunk
            .try_push(CsCmd::SetStencilReference(i))
            .expect("chunk has room");
    }

    let refs: Vec<u32> = chunk
        .commands()
        .iter()
        .map(|cmd| match cmd {
            CsCmd::SetStencilReference(value) => *value,
            other => panic!("unexpected command {other:?}"),
        })
        .collect();
    assert_eq!(refs, (0..10).collect::<Vec<_>>());
}

#[test]
fn full_chunk_rejects_without_dropping_the_command() {
    let mut chunk = CsChunk::new(ChunkTag::SingleUse);
    for _ in 0..CHUNK_CAPACITY {
        chunk
            .try_push(CsCmd::SetBlendConstants([1.0, 0.5, 0.25, 0.0]))
            .expect("chunk has room");
    }

    // The rejected command comes back to the caller so it can be retried
    // on a fresh chunk.
    match chunk.try_push(CsCmd::SetStencilReference(42)) {
        Err(CsCmd::SetStencilReference(42)) => {}
        other => panic!("expected the command back, got {other:?}"),
    }
}

#[test]
fn replayable_chunks_keep_their_tag() {
    let chunk = CsChunk::new(ChunkTag::Replayable);
    assert_eq!(chunk.tag(), ChunkTag::Replayable);
    assert!(chunk.is_empty());
}
