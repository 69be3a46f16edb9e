use partstream_tonic_core::{
    Error, Result, decode_subgraph,
    partstream::{InitHandshake, SubgraphDef},
    proto::StreamFrame,
};

/// A validated init handshake and the computation it carries.
#[derive(Debug)]
pub struct Accepted {
    pub init: InitHandshake,
    pub subgraph: SubgraphDef,
}

impl Accepted {
    pub fn biz_name(&self) -> &str {
        self.subgraph
            .location
            .as_ref()
            .map_or("", |location| location.biz_name.as_str())
    }
}

/// Validates the first frame of an exchange and takes its handshake.
///
/// The frame must carry a handshake for its own partition, the payload must
/// decode to a descriptor of the same graph, and the descriptor must address
/// this partition with a matching partition count.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] or [`Error::Coordinator`] describing the
/// first violated rule.
pub fn accept_handshake(frame: &mut StreamFrame) -> Result<Accepted> {
    let init = frame.init.take().ok_or_else(|| Error::InvalidRequest {
        reason: "first frame must carry the init handshake".to_string(),
    })?;
    let init = InitHandshake::try_from(init)?;
    if frame.part_id != init.part_id {
        return Err(Error::InvalidRequest {
            reason: format!(
                "handshake for partition {} sent on partition {}",
                init.part_id, frame.part_id
            ),
        });
    }

    let subgraph = decode_subgraph(&init)?;
    if let Some(part_count) = subgraph.part_count() {
        if part_count != init.part_count {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "descriptor part count {part_count} disagrees with handshake {}",
                    init.part_count
                ),
            });
        }
    }
    let part_ids = subgraph.part_ids();
    if !part_ids.is_empty() && !part_ids.contains(&init.part_id) {
        return Err(Error::InvalidRequest {
            reason: format!("partition {} is not addressed by the job", init.part_id),
        });
    }

    Ok(Accepted { init, subgraph })
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_tonic_core::{
        partstream::{Codec, DiagnosticsContext, RunParams},
        proto,
    };
    use prost::Message as _;

    fn frame(part_id: u32, subgraph: &SubgraphDef, part_count: u32) -> StreamFrame {
        let raw = subgraph.encode_to_vec();
        let init = InitHandshake {
            payload: Codec::Zstd.compress(&raw).unwrap().into(),
            codec: Codec::Zstd,
            part_id,
            part_count,
            graph_id: subgraph.graph_id,
            remaining_ms: None,
            params: RunParams::default(),
            diagnostics: DiagnosticsContext::default(),
        };
        StreamFrame {
            part_id,
            init: Some(proto::InitHandshake::from(init)),
            ..StreamFrame::default()
        }
    }

    fn subgraph(part_count: u32) -> SubgraphDef {
        let mut subgraph = SubgraphDef::new(5, "summary", "body");
        subgraph.part_info_mut().part_count = Some(part_count);
        subgraph
    }

    #[test]
    fn valid_handshake_is_taken_from_the_frame() {
        let mut frame = frame(1, &subgraph(4), 4);
        let accepted = accept_handshake(&mut frame).unwrap();
        assert!(frame.init.is_none());
        assert_eq!(accepted.init.part_id, 1);
        assert_eq!(accepted.biz_name(), "summary");
        assert_eq!(accepted.subgraph.graph_id, 5);
    }

    #[test]
    fn missing_handshake_is_rejected() {
        let mut frame = StreamFrame::default();
        assert!(matches!(
            accept_handshake(&mut frame),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn part_count_mismatch_is_rejected() {
        let mut frame = frame(1, &subgraph(8), 4);
        assert!(matches!(
            accept_handshake(&mut frame),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn unaddressed_partition_is_rejected() {
        let mut frame = frame(1, &subgraph(4).with_part_ids([0, 2]), 4);
        assert!(matches!(
            accept_handshake(&mut frame),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn mismatched_frame_partition_is_rejected() {
        let mut frame = frame(1, &subgraph(4), 4);
        frame.part_id = 2;
        assert!(matches!(
            accept_handshake(&mut frame),
            Err(Error::InvalidRequest { .. })
        ));
    }
}
