//! Reductions: primal results, adjoint hand-back, tie policy, vector mode.

mod common;

use adcomm::{ActiveReal, CommTape, OpRegistry};
use approx::assert_relative_eq;
use common::run_ranks;

#[test]
fn allreduce_sum_round_trips_the_adjoint() {
    run_ranks(3, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let send = [tape.register_input(comm.rank() as f64 + 1.0)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.sum()).unwrap();
        tape.stop_recording();

        assert_relative_eq!(recv[0].value(), 6.0);
        comm.barrier().unwrap();

        tape.set_adjoint(recv[0].index(), 0, 1.0);
        tape.evaluate_reverse().unwrap();
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), 1.0);
    });
}

#[test]
fn rooted_reduce_hands_the_root_seed_to_every_contributor() {
    run_ranks(4, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        let root = 1;
        tape.start_recording();

        let send = [tape.register_input(comm.rank() as f64)];
        let mut recv = if comm.rank() == root {
            vec![ActiveReal::new(0.0)]
        } else {
            Vec::new()
        };
        comm.reduce(&mut tape, &send, &mut recv, &ops.sum(), root).unwrap();
        tape.stop_recording();

        if comm.rank() == root {
            assert_relative_eq!(recv[0].value(), 6.0);
            tape.set_adjoint(recv[0].index(), 0, 2.5);
        }
        comm.barrier().unwrap();

        tape.evaluate_reverse().unwrap();
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), 2.5);
    });
}

#[test]
fn allreduce_max_gives_the_adjoint_to_the_single_winner() {
    run_ranks(3, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let send = [tape.register_input(comm.rank() as f64)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.max()).unwrap();
        tape.stop_recording();

        assert_relative_eq!(recv[0].value(), 2.0);
        comm.barrier().unwrap();

        tape.set_adjoint(recv[0].index(), 0, 1.0);
        tape.evaluate_reverse().unwrap();
        let expected = if comm.rank() == 2 { 1.0 } else { 0.0 };
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), expected);
    });
}

#[test]
fn max_tie_goes_to_the_lowest_rank_and_conserves_the_seed() {
    run_ranks(3, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        // Ranks 0 and 2 tie at 7.0.
        let value = if comm.rank() == 1 { 3.0 } else { 7.0 };
        let send = [tape.register_input(value)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.max()).unwrap();
        tape.stop_recording();

        assert_relative_eq!(recv[0].value(), 7.0);
        comm.barrier().unwrap();

        tape.set_adjoint(recv[0].index(), 0, 1.0);
        tape.evaluate_reverse().unwrap();
        let expected = if comm.rank() == 0 { 1.0 } else { 0.0 };
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), expected);
    });
}

#[test]
fn two_rank_allreduce_max_splits_the_seed_zero_one() {
    run_ranks(2, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let value = if comm.rank() == 0 { 3.0 } else { 5.0 };
        let send = [tape.register_input(value)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.max()).unwrap();
        tape.stop_recording();

        assert_relative_eq!(recv[0].value(), 5.0);
        comm.barrier().unwrap();

        tape.set_adjoint(recv[0].index(), 0, 1.0);
        tape.evaluate_reverse().unwrap();
        let expected = if comm.rank() == 1 { 1.0 } else { 0.0 };
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), expected);
    });
}

#[test]
fn allreduce_prod_rescales_by_the_remaining_product() {
    run_ranks(3, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let value = comm.rank() as f64 + 2.0; // 2, 3, 4
        let send = [tape.register_input(value)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.prod()).unwrap();
        tape.stop_recording();

        assert_relative_eq!(recv[0].value(), 24.0);
        comm.barrier().unwrap();

        tape.set_adjoint(recv[0].index(), 0, 1.0);
        tape.evaluate_reverse().unwrap();
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), 24.0 / value);
    });
}

#[test]
fn rooted_reduce_max_picks_the_winner_across_ranks() {
    run_ranks(3, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let send = [tape.register_input(10.0 - comm.rank() as f64)];
        let mut recv = if comm.rank() == 0 {
            vec![ActiveReal::new(0.0)]
        } else {
            Vec::new()
        };
        comm.reduce(&mut tape, &send, &mut recv, &ops.max(), 0).unwrap();
        tape.stop_recording();

        if comm.rank() == 0 {
            assert_relative_eq!(recv[0].value(), 10.0);
            tape.set_adjoint(recv[0].index(), 0, 4.0);
        }
        comm.barrier().unwrap();

        tape.evaluate_reverse().unwrap();
        let expected = if comm.rank() == 0 { 4.0 } else { 0.0 };
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), expected);
    });
}

#[test]
fn vector_mode_propagates_each_direction_independently() {
    run_ranks(2, |comm| {
        let mut tape = CommTape::with_vector_width(2);
        let ops = OpRegistry::default();
        tape.start_recording();

        let send = [tape.register_input(comm.rank() as f64)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.sum()).unwrap();
        tape.stop_recording();
        comm.barrier().unwrap();

        tape.set_adjoint(recv[0].index(), 0, 1.0);
        tape.set_adjoint(recv[0].index(), 1, -3.0);
        tape.evaluate_reverse().unwrap();
        assert_relative_eq!(tape.adjoint(send[0].index(), 0), 1.0);
        assert_relative_eq!(tape.adjoint(send[0].index(), 1), -3.0);
    });
}

#[test]
fn primal_replay_tracks_updated_inputs() {
    run_ranks(2, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let send = [tape.register_input(1.0)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.sum()).unwrap();
        tape.stop_recording();

        assert_relative_eq!(recv[0].value(), 2.0);
        comm.barrier().unwrap();

        tape.set_primal(send[0].index(), 10.0);
        tape.evaluate_primal().unwrap();
        assert_relative_eq!(tape.primal(recv[0].index()), 20.0);
    });
}

#[test]
fn forward_mode_leaves_reduction_tangents_untouched() {
    run_ranks(2, |comm| {
        let mut tape = CommTape::new();
        let ops = OpRegistry::default();
        tape.start_recording();

        let send = [tape.register_input(1.0)];
        let mut recv = [ActiveReal::new(0.0)];
        comm.allreduce(&mut tape, &send, &mut recv, &ops.sum()).unwrap();
        tape.stop_recording();
        comm.barrier().unwrap();

        tape.set_tangent(send[0].index(), 0, 1.0);
        tape.evaluate_forward().unwrap();
        // Tangent propagation through reductions is a documented gap.
        assert_relative_eq!(tape.tangent(recv[0].index(), 0), 0.0);
    });
}
