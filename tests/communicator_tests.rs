mod util;

use mesh_redistribute::algs::communicator::{
    CommTag, Communicator, ExchangeTags, NoComm, RayonComm, Wait,
};
use mesh_redistribute::algs::exchange::{PairwiseSchedule, TransferStrategy, exchange_payloads};
use mesh_redistribute::mesh_error::MeshError;
use serial_test::serial;
use util::{CountingComm, run_ranks};

#[test]
#[serial]
fn rayon_round_trip() {
    let tag = CommTag::new(0x7000);
    let c0 = RayonComm::new(0, 2);
    let c1 = RayonComm::new(1, 2);

    let msg = b"hello";
    c0.isend(1, tag.as_u16(), msg);
    let got = c1.irecv(0, tag.as_u16()).wait().unwrap();
    assert_eq!(&got, msg);
    assert_eq!(c0.mailbox().pending(), 0);
}

#[test]
#[serial]
fn rayon_fifo_order() {
    let tag = CommTag::new(0x7001);
    let c0 = RayonComm::new(0, 2);
    let c1 = RayonComm::new(1, 2);

    for i in 0..10u8 {
        c0.isend(1, tag.as_u16(), &[i]);
    }
    let out: Vec<u8> = (0..10)
        .map(|_| c1.irecv(0, tag.as_u16()).wait().unwrap()[0])
        .collect();
    assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
}

#[test]
#[serial]
fn tags_keep_messages_apart() {
    let c0 = RayonComm::new(0, 2);
    let c1 = RayonComm::new(1, 2);
    let (a, b) = (CommTag::new(0x7002), CommTag::new(0x7002).offset(1));

    c0.send(1, a, b"first");
    c0.send(1, b, b"second");
    assert_eq!(c1.recv(0, b).unwrap(), b"second");
    assert_eq!(c1.recv(0, a).unwrap(), b"first");
}

#[test]
fn private_worlds_do_not_share_mail() {
    let w1 = RayonComm::world(2);
    let w2 = RayonComm::world(2);
    w1[0].isend(1, 5, b"x");
    assert_eq!(w1[1].mailbox().pending(), 1);
    assert_eq!(w2[1].mailbox().pending(), 0);
}

#[test]
fn no_comm_is_a_world_of_one() {
    assert_eq!(NoComm.rank(), 0);
    assert_eq!(NoComm.size(), 1);
    let out = exchange_payloads(
        &NoComm,
        vec![b"mine".to_vec()],
        ExchangeTags::from_base(CommTag::EXCHANGE),
        TransferStrategy::Lean,
    )
    .unwrap();
    assert_eq!(out, vec![b"mine".to_vec()]);
}

#[test]
fn pairwise_rounds_pair_up() {
    let nprocs = 5;
    let schedules: Vec<_> = (0..nprocs).map(|r| PairwiseSchedule::new(r, nprocs)).collect();
    for (me, s) in schedules.iter().enumerate() {
        for (round, (to, from)) in s.rounds().enumerate() {
            // whoever I send to receives from me in the same round
            assert_eq!(schedules[to].sources[round], me);
            assert_eq!(schedules[from].targets[round], me);
        }
    }
}

#[test]
fn payload_exchange_matches_across_strategies() {
    for strategy in [TransferStrategy::Lean, TransferStrategy::Fast] {
        let out = run_ranks(4, |c| {
            let me = c.rank();
            let outgoing: Vec<Vec<u8>> = (0..4)
                .map(|dst| if (me + dst) % 3 == 0 { Vec::new() } else { vec![me as u8; dst + 1] })
                .collect();
            exchange_payloads(&c, outgoing, ExchangeTags::from_base(CommTag::EXCHANGE), strategy)
                .unwrap()
        });
        for (me, incoming) in out.iter().enumerate() {
            for (src, bytes) in incoming.iter().enumerate() {
                let want = if (src + me) % 3 == 0 { Vec::new() } else { vec![src as u8; me + 1] };
                assert_eq!(*bytes, want, "{strategy:?}: {src} -> {me}");
            }
        }
    }
}

#[test]
fn payload_exchange_rejects_wrong_fan_out() {
    let out = run_ranks(2, |c| {
        exchange_payloads(
            &c,
            vec![Vec::new()],
            ExchangeTags::from_base(CommTag::EXCHANGE),
            TransferStrategy::Lean,
        )
    });
    assert!(out.iter().all(|r| matches!(r, Err(MeshError::Configuration(_)))));
}

#[test]
fn votes_reach_every_rank() {
    let out = run_ranks(3, |c| {
        let world = c.world_group(CommTag::VOTE);
        let any = world.all_vote(c.rank() == 2).unwrap();
        let local = if c.rank() == 1 {
            Err(MeshError::Configuration("bad input".into()))
        } else {
            Ok(c.rank())
        };
        (any, world.vote_result(local, "testing"))
    });
    assert!(out.iter().all(|(any, _)| *any));
    assert!(matches!(out[0].1, Err(MeshError::RemoteFailure { stage: "testing" })));
    assert!(matches!(out[1].1, Err(MeshError::Configuration(_))));
    assert!(matches!(out[2].1, Err(MeshError::RemoteFailure { .. })));
}

#[test]
fn sub_groups_only_involve_members() {
    let out = run_ranks(4, |c| {
        let comm = CountingComm::new(c);
        let me = comm.rank();
        let sum = if (1..=2).contains(&me) {
            let g = comm.sub_group(1, 2, CommTag::COUNTS);
            Some(g.all_reduce_sum(me).unwrap())
        } else {
            None
        };
        (sum, comm.messages())
    });
    assert_eq!(out[0], (None, 0));
    assert_eq!(out[3], (None, 0));
    assert_eq!(out[1].0, Some(3));
    assert_eq!(out[2].0, Some(3));
}
