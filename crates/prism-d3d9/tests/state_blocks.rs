use pretty_assertions::assert_eq;

use prism_d3d9::state::{render_state_dirty, rs, DirtyFlags9, State9};
use prism_d3d9::translate::translate_blend9;
use prism_d3d9::{StateBlock9, StateBlockType9};

#[test]
fn whole_pipeline_block_restores_blend_enable() {
    // Default state, then enable blending.
    let mut state = State9::default();
    state.render_states[rs::ALPHABLENDENABLE as usize] = 1;

    // Capture the whole pipeline, then change the live state.
    let mut block = StateBlock9::new(StateBlockType9::All);
    block.capture(&state);
    state.render_states[rs::ALPHABLENDENABLE as usize] = 0;

    // Applying the block restores the captured value and dirties
    // everything, so the next draw projects the blend state afresh.
    let dirty = block.apply(&mut state);
    assert_eq!(state.render_states[rs::ALPHABLENDENABLE as usize], 1);
    assert!(dirty.contains(DirtyFlags9::BLEND));

    // The projected native state reflects the restored enable bit.
    let modes = translate_blend9(&state);
    assert!(modes[0].enable);
}

#[test]
fn capture_apply_is_identity_on_the_captured_subset() {
    let mut state = State9::default();
    state.render_states[rs::SRCBLEND as usize] = 5;
    state.render_states[rs::STENCILREF as usize] = 0x42;
    state.sampler_states[3][prism_d3d9::state::samp::MAGFILTER as usize] = 2;

    let mut block = StateBlock9::new(StateBlockType9::All);
    block.capture(&state);

    let snapshot = state.render_states;
    let sampler_snapshot = state.sampler_states;

    block.apply(&mut state);
    assert_eq!(state.render_states, snapshot);
    assert_eq!(state.sampler_states, sampler_snapshot);
}

#[test]
fn recorded_blocks_apply_only_recorded_mutations() {
    let mut block = StateBlock9::new(StateBlockType9::Custom);
    block.record_render_state(rs::ZFUNC, 5);
    block.record_sampler_state(0, prism_d3d9::state::samp::MINFILTER, 2);

    let mut state = State9::default();
    let untouched = state.render_states[rs::SRCBLEND as usize];

    block.apply(&mut state);
    assert_eq!(state.render_states[rs::ZFUNC as usize], 5);
    assert_eq!(
        state.sampler_states[0][prism_d3d9::state::samp::MINFILTER as usize],
        2
    );
    assert_eq!(state.render_states[rs::SRCBLEND as usize], untouched);
}

#[test]
fn out_of_range_render_states_have_no_dirty_projection() {
    assert_eq!(render_state_dirty(9999), DirtyFlags9::empty());
}
