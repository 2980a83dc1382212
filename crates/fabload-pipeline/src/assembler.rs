use std::sync::Arc;

use fabload_codec::{create_signed_tx, sign_proposal, CodecError};
use fabload_crypto::Signer;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::element::{UnitError, WorkUnit};
use crate::error::{PipelineError, Stage};

/// Signs each raw request.
pub fn sign_unit(unit: &mut WorkUnit, signer: &dyn Signer) -> Result<(), AssembleError> {
    let signed = sign_proposal(unit.request(), signer)?;
    unit.attach_signed_request(signed)?;
    Ok(())
}

/// Combines the request and its endorsement into a signed envelope.
pub fn assemble_unit(unit: &mut WorkUnit, signer: &dyn Signer) -> Result<(), AssembleError> {
    let Some(endorsement) = unit.endorsement() else {
        return Err(AssembleError::Unit(UnitError::OutOfOrder {
            seq: unit.seq(),
            field: "submittable",
            stage: unit.stage(),
        }));
    };
    let envelope = create_signed_tx(unit.request(), signer, std::slice::from_ref(endorsement))?;
    unit.attach_submittable(envelope)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Unit(#[from] UnitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Sign,
    Assemble,
}

impl PoolKind {
    fn stage(self) -> Stage {
        match self {
            PoolKind::Sign => Stage::Signer,
            PoolKind::Assemble => Stage::Assembly,
        }
    }
}

/// Fixed-size pool pulling units from one shared queue, transforming them
/// with the signer and pushing them to the next stage.
///
/// A signer failure or a unit arriving at the wrong stage is fatal: it is
/// reported once on `fatal` and the task stops.
pub struct AssemblyPool {
    kind: PoolKind,
    signer: Arc<dyn Signer>,
    input: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    output: mpsc::Sender<WorkUnit>,
    fatal: mpsc::Sender<PipelineError>,
    cancel: CancellationToken,
}

impl AssemblyPool {
    /// Pool that signs generated requests for the endorsement dispatcher.
    pub fn signers(
        signer: Arc<dyn Signer>,
        input: mpsc::Receiver<WorkUnit>,
        output: mpsc::Sender<WorkUnit>,
        fatal: mpsc::Sender<PipelineError>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(PoolKind::Sign, signer, input, output, fatal, cancel)
    }

    /// Pool that assembles endorsed units for the submission dispatcher.
    pub fn integrators(
        signer: Arc<dyn Signer>,
        input: mpsc::Receiver<WorkUnit>,
        output: mpsc::Sender<WorkUnit>,
        fatal: mpsc::Sender<PipelineError>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(PoolKind::Assemble, signer, input, output, fatal, cancel)
    }

    fn new(
        kind: PoolKind,
        signer: Arc<dyn Signer>,
        input: mpsc::Receiver<WorkUnit>,
        output: mpsc::Sender<WorkUnit>,
        fatal: mpsc::Sender<PipelineError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            signer,
            input: Arc::new(Mutex::new(input)),
            output,
            fatal,
            cancel,
        }
    }

    pub fn spawn(self, size: usize, tasks: &mut JoinSet<()>) {
        let pool = Arc::new(self);
        for _ in 0..size.max(1) {
            tasks.spawn(pool.clone().run_task());
        }
    }

    async fn next_unit(&self) -> Option<WorkUnit> {
        let mut input = self.input.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            unit = input.recv() => unit,
        }
    }

    async fn run_task(self: Arc<Self>) {
        let stage = self.kind.stage();
        while let Some(mut unit) = self.next_unit().await {
            let transformed = match self.kind {
                PoolKind::Sign => sign_unit(&mut unit, self.signer.as_ref()),
                PoolKind::Assemble => assemble_unit(&mut unit, self.signer.as_ref()),
            };
            match transformed {
                Ok(()) => {}
                Err(AssembleError::Codec(source)) => {
                    error!(%stage, seq = unit.seq(), error = %source, "signing failed");
                    let _ = self.fatal.try_send(PipelineError::Signer { stage, source });
                    break;
                }
                Err(AssembleError::Unit(source)) => {
                    error!(%stage, error = %source, "unit out of order");
                    let _ = self.fatal.try_send(PipelineError::Unit { stage, source });
                    break;
                }
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.output.send(unit) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(%stage, "pool task stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fabload_codec::{create_proposal, endorse_proposal, Transaction};
    use fabload_crypto::{Identity, Signer, SigningAlgorithm, SigningError};
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;
    use tokio_util::sync::CancellationToken;

    use super::{assemble_unit, sign_unit, AssemblyPool};
    use crate::element::{UnitStage, WorkUnit};
    use crate::error::{PipelineError, Stage};

    fn identity() -> Identity {
        Identity::ephemeral("Org1MSP", SigningAlgorithm::Ecdsa).expect("identity")
    }

    fn unit(seq: u64, creator: &[u8]) -> WorkUnit {
        WorkUnit::new(seq, create_proposal(creator, "mychannel", "cc", "addFile", Vec::new()))
    }

    #[test]
    fn sign_then_assemble_produces_submittable_unit() {
        let client = identity();
        let peer = identity();
        let mut unit = unit(1, client.identity());
        sign_unit(&mut unit, &client).expect("sign");
        let signed = unit.signed_request().expect("signed").clone();
        let response = endorse_proposal(&signed, &peer, 200, "").expect("endorse");
        unit.attach_endorsement(response).expect("attach");

        assemble_unit(&mut unit, &client).expect("assemble");
        assert_eq!(unit.stage(), UnitStage::Submittable);
        let payload = unit
            .submittable()
            .expect("envelope")
            .decode_payload()
            .expect("payload");
        let tx: Transaction = fabload_codec::decode(&payload.data).expect("tx");
        assert_eq!(tx.endorsements.len(), 1);
    }

    #[test]
    fn assembling_unendorsed_unit_is_rejected() {
        let client = identity();
        let mut unit = unit(1, client.identity());
        assert!(assemble_unit(&mut unit, &client).is_err());
    }

    struct BrokenSigner;

    impl Signer for BrokenSigner {
        fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, SigningError> {
            Err(SigningError::SignFailed)
        }

        fn identity(&self) -> &[u8] {
            b"broken"
        }
    }

    #[tokio::test]
    async fn signer_pool_forwards_signed_units() {
        let client = Arc::new(identity());
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let mut tasks = JoinSet::new();
        AssemblyPool::signers(client.clone(), in_rx, out_tx, fatal_tx, CancellationToken::new())
            .spawn(5, &mut tasks);

        let creator = client.identity().to_vec();
        let feeder = tokio::spawn(async move {
            for seq in 0..20 {
                in_tx.send(unit(seq, &creator)).await.expect("send");
            }
        });

        // More units than the output queue holds, so drain while feeding.
        let mut seqs = Vec::new();
        while let Some(unit) = out_rx.recv().await {
            assert_eq!(unit.stage(), UnitStage::Signed);
            seqs.push(unit.seq());
        }
        feeder.await.expect("feeder");
        while tasks.join_next().await.is_some() {}
        seqs.sort_unstable();
        assert_eq!(seqs, (0..20).collect::<Vec<u64>>());
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn signer_failure_is_fatal() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let mut tasks = JoinSet::new();
        AssemblyPool::signers(Arc::new(BrokenSigner), in_rx, out_tx, fatal_tx, CancellationToken::new())
            .spawn(1, &mut tasks);

        in_tx.send(unit(0, b"broken")).await.expect("send");
        let err = fatal_rx.recv().await.expect("fatal error should be reported");
        assert!(matches!(err, PipelineError::Signer { stage: Stage::Signer, .. }));
        assert_eq!(err.to_string(), "signer signing failed: signing error: signing failed");
    }

    #[tokio::test]
    async fn out_of_order_unit_is_fatal_for_integrators() {
        let client = Arc::new(identity());
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let mut tasks = JoinSet::new();
        AssemblyPool::integrators(client.clone(), in_rx, out_tx, fatal_tx, CancellationToken::new())
            .spawn(1, &mut tasks);

        in_tx.send(unit(7, client.identity())).await.expect("send");
        let err = fatal_rx.recv().await.expect("fatal error should be reported");
        assert!(matches!(err, PipelineError::Unit { stage: Stage::Assembly, .. }));
        assert_eq!(err.stage(), Some(Stage::Assembly));
        assert_eq!(
            err.to_string(),
            "assembly received a unit out of order: unit 7: cannot attach submittable at stage Requested"
        );

        while tasks.join_next().await.is_some() {}
        assert!(out_rx.recv().await.is_none());
    }
}
