//! Association state machine.
//!
//! A pure transition function over the states of a DICOM association,
//! with no I/O of its own.
//! The association orchestrators feed it events
//! as PDUs are sent and received,
//! and interpret the returned [`Action`]s
//! (arming or disarming the ARTIM timer,
//! emitting an A-ABORT or an A-RELEASE-RP).

use snafu::Snafu;

/// The state of a DICOM association.
///
/// `Aborted` and `Closed` are terminal:
/// once reached, the machine never re-enters `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// No association activity yet.
    /// A connected transport does not leave this state by itself.
    Idle,
    /// A-ASSOCIATE-RQ was sent, awaiting the response under ARTIM.
    AwaitingAssociateResponse,
    /// The association is established; data transfer is permitted.
    Established,
    /// A-RELEASE-RQ was sent, awaiting the response under ARTIM.
    AwaitingReleaseResponse,
    /// A release request from the peer was answered;
    /// waiting for the transport to go down.
    Releasing,
    /// The association was aborted, locally or by the peer.
    Aborted,
    /// The association ended in an orderly fashion.
    Closed,
}

impl AssociationState {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, AssociationState::Aborted | AssociationState::Closed)
    }
}

/// An event fed into the association state machine.
///
/// Only the event discriminant matters for the transition;
/// the PDU contents stay with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationEvent {
    /// The transport connection was established.
    TransportConnected,
    /// An A-ASSOCIATE-RQ was sent to the peer.
    AssociateRequestSent,
    /// An A-ASSOCIATE-AC arrived.
    AssociateAcceptReceived,
    /// An A-ASSOCIATE-RJ arrived.
    AssociateRejectReceived,
    /// An A-ASSOCIATE-RQ arrived (acceptor side).
    AssociateRequestReceived,
    /// A P-DATA-TF was sent.
    DataTransferSent,
    /// A P-DATA-TF arrived.
    DataTransferReceived,
    /// The local user asked to release the association.
    LocalReleaseRequest,
    /// An A-RELEASE-RQ arrived.
    ReleaseRequestReceived,
    /// An A-RELEASE-RP arrived.
    ReleaseResponseReceived,
    /// An A-ABORT was sent.
    AbortSent,
    /// An A-ABORT arrived.
    AbortReceived,
    /// The ARTIM timer went off while waiting for a response.
    ArtimTimerExpired,
    /// The transport connection went down.
    TransportConnectionClosed,
}

/// A side effect the caller must carry out
/// after applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Arm the ARTIM timer.
    StartArtim,
    /// Disarm the ARTIM timer.
    StopArtim,
    /// Emit an A-ABORT to the peer (best effort) and close the transport.
    EmitAbort,
    /// Emit an A-RELEASE-RP to the peer.
    EmitReleaseResponse,
}

/// The outcome of a legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: AssociationState,
    pub action: Option<Action>,
}

impl Transition {
    fn to(state: AssociationState) -> Self {
        Transition {
            state,
            action: None,
        }
    }

    fn with(state: AssociationState, action: Action) -> Self {
        Transition {
            state,
            action: Some(action),
        }
    }
}

/// The given event is not legal in the current state.
/// The machine stays where it was.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(display("event {:?} is not allowed in state {:?}", event, state))]
pub struct InvalidTransition {
    pub state: AssociationState,
    pub event: AssociationEvent,
}

/// Apply one event to the association state machine.
///
/// Returns the new state and an optional action for the caller,
/// or [`InvalidTransition`] when the event is not legal in `state`
/// (in which case the state is unchanged).
pub fn transition(
    state: AssociationState,
    event: AssociationEvent,
) -> Result<Transition, InvalidTransition> {
    use Action::*;
    use AssociationEvent as Ev;
    use AssociationState as St;

    match (state, event) {
        // connecting the transport does not advance the association
        (St::Idle, Ev::TransportConnected) => Ok(Transition::to(St::Idle)),

        // requestor path
        (St::Idle, Ev::AssociateRequestSent) => {
            Ok(Transition::with(St::AwaitingAssociateResponse, StartArtim))
        }
        (St::AwaitingAssociateResponse, Ev::AssociateAcceptReceived) => {
            Ok(Transition::with(St::Established, StopArtim))
        }
        (St::AwaitingAssociateResponse, Ev::AssociateRejectReceived) => {
            Ok(Transition::with(St::Closed, StopArtim))
        }
        (St::AwaitingAssociateResponse, Ev::ArtimTimerExpired) => {
            Ok(Transition::with(St::Aborted, EmitAbort))
        }

        // acceptor path
        (St::Idle, Ev::AssociateRequestReceived) => Ok(Transition::to(St::Established)),

        // data transfer is only legal when established
        (St::Established, Ev::DataTransferSent) => Ok(Transition::to(St::Established)),
        (St::Established, Ev::DataTransferReceived) => Ok(Transition::to(St::Established)),

        // orderly release
        (St::Established, Ev::LocalReleaseRequest) => {
            Ok(Transition::with(St::AwaitingReleaseResponse, StartArtim))
        }
        (St::Established, Ev::ReleaseRequestReceived) => {
            Ok(Transition::with(St::Releasing, EmitReleaseResponse))
        }
        (St::AwaitingReleaseResponse, Ev::ReleaseResponseReceived) => {
            Ok(Transition::with(St::Closed, StopArtim))
        }
        // release collision: the peer requested release
        // while our own request was in flight;
        // answer it and close
        (St::AwaitingReleaseResponse, Ev::ReleaseRequestReceived) => {
            Ok(Transition::with(St::Closed, EmitReleaseResponse))
        }
        (St::AwaitingReleaseResponse, Ev::ArtimTimerExpired) => {
            Ok(Transition::with(St::Aborted, EmitAbort))
        }

        // a non-release, non-abort PDU while established
        // (or while winding down) is a protocol violation
        (St::Established, Ev::AssociateAcceptReceived)
        | (St::Established, Ev::AssociateRejectReceived)
        | (St::Established, Ev::AssociateRequestReceived)
        | (St::Established, Ev::ReleaseResponseReceived)
        | (St::Releasing, Ev::DataTransferReceived)
        | (St::Releasing, Ev::AssociateRequestReceived)
        | (St::Releasing, Ev::ReleaseRequestReceived) => {
            Ok(Transition::with(St::Aborted, EmitAbort))
        }

        // aborts and transport loss are honored from any live state
        (st, Ev::AbortReceived) if !st.is_terminal() => Ok(Transition::to(St::Aborted)),
        (st, Ev::AbortSent) if !st.is_terminal() => Ok(Transition::to(St::Aborted)),
        (St::Aborted, Ev::TransportConnectionClosed) => Ok(Transition::to(St::Aborted)),
        (_, Ev::TransportConnectionClosed) => Ok(Transition::to(St::Closed)),

        (state, event) => Err(InvalidTransition { state, event }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssociationEvent as Ev;
    use AssociationState as St;

    fn apply(state: St, events: &[Ev]) -> St {
        events.iter().fold(state, |st, &ev| {
            transition(st, ev).expect("transition must be legal").state
        })
    }

    #[test]
    fn requestor_happy_path() {
        let st = apply(
            St::Idle,
            &[
                Ev::TransportConnected,
                Ev::AssociateRequestSent,
                Ev::AssociateAcceptReceived,
                Ev::DataTransferSent,
                Ev::DataTransferReceived,
                Ev::LocalReleaseRequest,
                Ev::ReleaseResponseReceived,
            ],
        );
        assert_eq!(st, St::Closed);
    }

    #[test]
    fn association_rejected_closes() {
        let st = apply(
            St::Idle,
            &[Ev::AssociateRequestSent, Ev::AssociateRejectReceived],
        );
        assert_eq!(st, St::Closed);
    }

    #[test]
    fn artim_expiry_aborts_with_emitted_abort() {
        let t = transition(St::AwaitingAssociateResponse, Ev::ArtimTimerExpired).unwrap();
        assert_eq!(t.state, St::Aborted);
        assert_eq!(t.action, Some(Action::EmitAbort));

        let t = transition(St::AwaitingReleaseResponse, Ev::ArtimTimerExpired).unwrap();
        assert_eq!(t.state, St::Aborted);
        assert_eq!(t.action, Some(Action::EmitAbort));
    }

    #[test]
    fn release_collision_is_legal() {
        let t = transition(St::AwaitingReleaseResponse, Ev::ReleaseRequestReceived).unwrap();
        assert_eq!(t.state, St::Closed);
        assert_eq!(t.action, Some(Action::EmitReleaseResponse));
    }

    #[test]
    fn abort_paths_end_aborted() {
        for st in [
            St::Idle,
            St::AwaitingAssociateResponse,
            St::Established,
            St::AwaitingReleaseResponse,
            St::Releasing,
        ] {
            assert_eq!(transition(st, Ev::AbortReceived).unwrap().state, St::Aborted);
            assert_eq!(transition(st, Ev::AbortSent).unwrap().state, St::Aborted);
        }
    }

    #[test]
    fn unexpected_pdu_while_established_aborts() {
        let t = transition(St::Established, Ev::AssociateAcceptReceived).unwrap();
        assert_eq!(t.state, St::Aborted);
        assert_eq!(t.action, Some(Action::EmitAbort));
    }

    #[test]
    fn releasing_peer_violation_aborts() {
        // a data transfer PDU after answering the peer's release request
        let t = transition(St::Releasing, Ev::DataTransferReceived).unwrap();
        assert_eq!(t.state, St::Aborted);
        assert_eq!(t.action, Some(Action::EmitAbort));
    }

    #[test]
    fn disallowed_events_leave_state_unchanged() {
        let err = transition(St::Idle, Ev::DataTransferSent).unwrap_err();
        assert_eq!(err.state, St::Idle);

        let err = transition(St::Closed, Ev::DataTransferSent).unwrap_err();
        assert_eq!(err.state, St::Closed);

        // no resurrection of a terminated association
        assert!(transition(St::Aborted, Ev::AssociateRequestSent).is_err());
        assert!(transition(St::Closed, Ev::AssociateAcceptReceived).is_err());
    }

    #[test]
    fn transport_loss_closes_live_states() {
        assert_eq!(
            transition(St::Established, Ev::TransportConnectionClosed)
                .unwrap()
                .state,
            St::Closed
        );
        assert_eq!(
            transition(St::Releasing, Ev::TransportConnectionClosed)
                .unwrap()
                .state,
            St::Closed
        );
        // an aborted association stays aborted
        assert_eq!(
            transition(St::Aborted, Ev::TransportConnectionClosed)
                .unwrap()
                .state,
            St::Aborted
        );
    }
}
