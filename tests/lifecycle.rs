//! Buffer and handle lifecycle across a full record/replay cycle.

mod common;

use adcomm::{stats, ActiveReal, CommTape, OpRegistry};
use approx::assert_relative_eq;
use common::run_ranks;

#[test]
fn full_cycle_releases_every_buffer() {
    run_ranks(2, |comm| {
        stats::take();
        {
            let mut tape = CommTape::new();
            let ops = OpRegistry::default();
            tape.start_recording();

            // Point-to-point, a collective and a reduction in one recording.
            let x = [tape.register_input(comm.rank() as f64 + 1.0)];
            if comm.rank() == 0 {
                comm.send(&mut tape, &x, 1, 0).unwrap();
            } else {
                let mut buf = [ActiveReal::new(0.0)];
                comm.recv(&mut tape, &mut buf, 0, 0).unwrap();
            }

            let mut everywhere = vec![ActiveReal::new(0.0); 2];
            comm.allgather(&mut tape, &x, &mut everywhere).unwrap();

            let mut total = [ActiveReal::new(0.0)];
            comm.allreduce(&mut tape, &x, &mut total, &ops.max()).unwrap();
            tape.stop_recording();
            comm.barrier().unwrap();

            tape.set_adjoint(total[0].index(), 0, 1.0);
            tape.evaluate_primal().unwrap();
            tape.evaluate_forward().unwrap();
            tape.evaluate_reverse().unwrap();
            comm.barrier().unwrap();
        }
        // Tape dropped: handles and their buffers must all be gone.
        let snap = stats::snapshot();
        assert!(snap.balanced(), "leaked buffers: {snap:?}");
        assert!(snap.handles_created > 0);
    });
}

#[test]
fn adjoint_buffers_never_outlive_the_sweep() {
    run_ranks(2, |comm| {
        stats::take();
        let mut tape = CommTape::new();
        tape.start_recording();

        let x = [tape.register_input(1.0)];
        let mut everywhere = vec![ActiveReal::new(0.0); 2];
        comm.allgather(&mut tape, &x, &mut everywhere).unwrap();
        tape.stop_recording();
        comm.barrier().unwrap();

        assert_eq!(stats::snapshot().adjoint_created, 0);
        tape.set_adjoint(everywhere[comm.rank() as usize].index(), 0, 1.0);
        tape.evaluate_reverse().unwrap();

        let snap = stats::snapshot();
        assert!(snap.adjoint_created > 0);
        assert_eq!(snap.adjoint_created, snap.adjoint_dropped);
        comm.barrier().unwrap();
    });
}

#[test]
fn one_handle_per_recorded_operation() {
    run_ranks(2, |comm| {
        stats::take();
        let mut tape = CommTape::new();
        tape.start_recording();

        let x = [tape.register_input(1.0)];
        let mut everywhere = vec![ActiveReal::new(0.0); 2];
        comm.allgather(&mut tape, &x, &mut everywhere).unwrap();
        comm.allgather(&mut tape, &x, &mut everywhere).unwrap();
        tape.stop_recording();

        assert_eq!(stats::snapshot().handles_created, 2);
        assert_eq!(tape.entry_kinds().len(), 2);
        comm.barrier().unwrap();
    });
}

#[test]
fn reverse_restores_overwritten_primals_when_requested() {
    run_ranks(2, |comm| {
        let mut tape = CommTape::new();
        tape.set_old_primals_required(true);
        tape.start_recording();

        let x;
        let mut received = [ActiveReal::new(0.0)];
        if comm.rank() == 0 {
            x = [tape.register_input(2.0)];
            comm.send(&mut tape, &x, 1, 0).unwrap();
        } else {
            x = [ActiveReal::new(0.0)];
            comm.recv(&mut tape, &mut received, 0, 0).unwrap();
            assert_relative_eq!(received[0].value(), 2.0);
        }
        tape.stop_recording();
        comm.barrier().unwrap();

        // Re-run the primal with a changed input, then undo it in reverse.
        if comm.rank() == 0 {
            tape.set_primal(x[0].index(), 7.0);
        }
        tape.evaluate_primal().unwrap();
        if comm.rank() == 1 {
            assert_relative_eq!(tape.primal(received[0].index()), 7.0);
        }
        comm.barrier().unwrap();

        tape.evaluate_reverse().unwrap();
        if comm.rank() == 1 {
            // The receive's overwrite was rolled back to the pre-sweep value.
            assert_relative_eq!(tape.primal(received[0].index()), 2.0);
        }
        comm.barrier().unwrap();
    });
}
