//! TCP connection states and the user-close state machine, as described in
//! [RFC 793].
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

/// Different TCP connection states.
///
/// Variants are declared in protocol order so states can be compared: every
/// state at or after `ESTABLISHED` has completed the handshake, and every
/// state at or after `FIN_WAIT_2` has had its FIN acknowledged.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum ConnectionState {
    /// Represents no connection state at all.
    CLOSED,
    /// Represents waiting for a connection request from any remote TCP and
    /// port.
    LISTEN,
    /// Represents waiting for a matching connection request after having sent a
    /// connection request.
    SYN_SENT,
    /// Represents waiting for a confirming connection request acknowledgment
    /// after having both received and sent a connection request.
    SYN_RECEIVED,
    /// Represents an open connection, data received can be delivered to the
    /// user. The normal state for the data transfer phase of the connection.
    ESTABLISHED,
    /// Represents waiting for a connection termination request from the local
    /// user.
    CLOSE_WAIT,
    /// Represents waiting for a connection termination request from the remote
    /// TCP, or an acknowledgment of the connection termination request
    /// previously sent.
    FIN_WAIT_1,
    /// Represents waiting for a connection termination request acknowledgment
    /// from the remote TCP.
    CLOSING,
    /// Represents waiting for an acknowledgment of the connection termination
    /// request previously sent to the remote TCP (which includes an
    /// acknowledgment of its connection termination request).
    LAST_ACK,
    /// Represents waiting for a connection termination request from the remote
    /// TCP.
    FIN_WAIT_2,
    /// Represents waiting for enough time to pass to be sure the remote TCP
    /// received the acknowledgment of its connection termination request.
    TIME_WAIT,
}

impl ConnectionState {
    /// Returns `true` once the three-way handshake has completed.
    pub fn have_established(self) -> bool {
        self >= ConnectionState::ESTABLISHED
    }

    /// Returns `true` once a SYN has been received from the peer, i.e. a reset
    /// must be sent when the connection is dropped.
    pub fn have_rcvd_syn(self) -> bool {
        self >= ConnectionState::SYN_RECEIVED
    }

    /// Returns `true` if the connection has neither sent nor received a SYN.
    pub fn is_embryonic(self) -> bool {
        self < ConnectionState::SYN_SENT
    }

    /// Returns `true` if `next` is reachable from `self` in a single step of
    /// the state diagram. Any state may move to `CLOSED`.
    ///
    /// (RFC 793 3.2)
    ///
    /// ```text
    ///                              +---------+ ---------\      active OPEN
    ///                              |  CLOSED |            \    -----------
    ///                              +---------+<---------\   \   create TCB
    ///                                |     ^              \   \  snd SYN
    ///                   passive OPEN |     |   CLOSE        \   \
    ///                   ------------ |     | ----------       \   \
    ///                    create TCB  |     | delete TCB         \   \
    ///                                V     |                      \   \
    ///                              +---------+            CLOSE    |    \
    ///                              |  LISTEN |          ---------- |     |
    ///                              +---------+          delete TCB |     |
    ///                   rcv SYN      |     |     SEND              |     |
    ///                  -----------   |     |    -------            |     V
    /// +---------+      snd SYN,ACK  /       \   snd SYN          +---------+
    /// |         |<-----------------           ------------------>|         |
    /// |   SYN   |                    rcv SYN                     |   SYN   |
    /// |   RCVD  |<-----------------------------------------------|   SENT  |
    /// |         |                    snd ACK                     |         |
    /// |         |------------------           -------------------|         |
    /// +---------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +---------+
    ///   |           --------------   |     |   -----------
    ///   |                  x         |     |     snd ACK
    ///   |                            V     V
    ///   |  CLOSE                   +---------+
    ///   | -------                  |  ESTAB  |
    ///   | snd FIN                  +---------+
    ///   |                   CLOSE    |     |    rcv FIN
    ///   V                  -------   |     |    -------
    /// +---------+          snd FIN  /       \   snd ACK          +---------+
    /// |  FIN    |<-----------------           ------------------>|  CLOSE  |
    /// | WAIT-1  |------------------                              |   WAIT  |
    /// +---------+          rcv FIN  \                            +---------+
    ///   | rcv ACK of FIN   -------   |                            CLOSE  |
    ///   | --------------   snd ACK   |                           ------- |
    ///   V        x                   V                           snd FIN V
    /// +---------+                  +---------+                   +---------+
    /// |FINWAIT-2|                  | CLOSING |                   | LAST-ACK|
    /// +---------+                  +---------+                   +---------+
    ///   |                rcv ACK of FIN |                 rcv ACK of FIN |
    ///   |  rcv FIN       -------------- |    Timeout=2MSL -------------- |
    ///   |  -------              x       V    ------------        x       V
    ///    \ snd ACK                 +---------+delete TCB         +---------+
    ///     ------------------------>|TIME WAIT|------------------>| CLOSED  |
    ///                              +---------+                   +---------+
    /// ```
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == CLOSED {
            return true;
        }

        matches!(
            (self, next),
            (CLOSED, LISTEN | SYN_SENT)
                | (LISTEN, SYN_RECEIVED | SYN_SENT)
                | (SYN_SENT, SYN_RECEIVED | ESTABLISHED)
                | (SYN_RECEIVED, ESTABLISHED | FIN_WAIT_1 | CLOSE_WAIT)
                | (ESTABLISHED, FIN_WAIT_1 | CLOSE_WAIT)
                | (CLOSE_WAIT, LAST_ACK)
                | (FIN_WAIT_1, FIN_WAIT_2 | CLOSING | TIME_WAIT)
                | (CLOSING, TIME_WAIT)
                | (FIN_WAIT_2, TIME_WAIT)
        )
    }
}

/// Action taken when the local user closes its side of the connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UserClose {
    /// Tear the connection down immediately; nothing was ever exchanged.
    Close,
    /// Handshake still in flight: send a FIN once it completes.
    DeferFin,
    /// Move to the given state and send a FIN.
    Transition(ConnectionState),
    /// A FIN has already been sent; nothing changes.
    Unchanged,
}

/// Maps the current state to the action required by a local close.
///
/// - `LISTEN` and `CLOSED` connections are closed outright.
/// - `SYN_SENT` and `SYN_RECEIVED` defer the FIN until the handshake finishes.
/// - `ESTABLISHED` moves to `FIN_WAIT_1`, `CLOSE_WAIT` to `LAST_ACK`.
pub fn user_close(state: ConnectionState) -> UserClose {
    match state {
        ConnectionState::LISTEN | ConnectionState::CLOSED => UserClose::Close,
        ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED => UserClose::DeferFin,
        ConnectionState::ESTABLISHED => UserClose::Transition(ConnectionState::FIN_WAIT_1),
        ConnectionState::CLOSE_WAIT => UserClose::Transition(ConnectionState::LAST_ACK),
        ConnectionState::FIN_WAIT_1
        | ConnectionState::CLOSING
        | ConnectionState::LAST_ACK
        | ConnectionState::FIN_WAIT_2
        | ConnectionState::TIME_WAIT => UserClose::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn user_close_mapping_valid() {
        assert_eq!(user_close(LISTEN), UserClose::Close);
        assert_eq!(user_close(CLOSED), UserClose::Close);
        assert_eq!(user_close(SYN_SENT), UserClose::DeferFin);
        assert_eq!(user_close(SYN_RECEIVED), UserClose::DeferFin);
        assert_eq!(user_close(ESTABLISHED), UserClose::Transition(FIN_WAIT_1));
        assert_eq!(user_close(CLOSE_WAIT), UserClose::Transition(LAST_ACK));
        assert_eq!(user_close(FIN_WAIT_2), UserClose::Unchanged);
        assert_eq!(user_close(TIME_WAIT), UserClose::Unchanged);
    }

    #[test]
    fn user_close_targets_are_transitions_valid() {
        for state in [ESTABLISHED, CLOSE_WAIT] {
            if let UserClose::Transition(next) = user_close(state) {
                assert!(state.can_transition_to(next));
            }
        }
    }

    #[test]
    fn state_ordering_valid() {
        assert!(!SYN_RECEIVED.have_established());
        assert!(ESTABLISHED.have_established());
        assert!(TIME_WAIT >= FIN_WAIT_2);
        assert!(LAST_ACK < FIN_WAIT_2);
        assert!(LISTEN.is_embryonic());
        assert!(!SYN_SENT.is_embryonic());
    }

    #[test]
    fn transition_table_invalid() {
        assert!(!CLOSED.can_transition_to(ESTABLISHED));
        assert!(!LISTEN.can_transition_to(FIN_WAIT_1));
        assert!(!TIME_WAIT.can_transition_to(ESTABLISHED));
        assert!(ESTABLISHED.can_transition_to(CLOSED));
    }
}
