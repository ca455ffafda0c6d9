use log::{debug, error, info, trace, warn};

use super::frame::{FrameReader, FrameWriter};
use super::protocol::{
    ExceptionCode, FunctionCode, SlaveRequest, SlaveResponse, StationAddress, FIXED_PAYLOAD_LEN,
};
use super::silence::{SilenceDetector, SilenceTimer};
use super::transport::{ByteSink, ByteSource};
use crate::devices::traits::RegisterBackend;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Idle,
    WaitSilence,
    ReadStationId,
    ReadFunctionCode,
    ReadFixedPayload,
    ReadCrc,
    Validate,
    Dispatch,
    Respond,
}

/// Why a cycle ended without putting anything on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotAddressed { station: u8 },
    CrcMismatch { computed: u16, received: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Dropped(DropReason),
    Responded { response: SlaveResponse, frame: Vec<u8> },
}

impl CycleOutcome {
    pub fn frame(&self) -> &[u8] {
        match self {
            CycleOutcome::Dropped(_) => &[],
            CycleOutcome::Responded { frame, .. } => frame.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub served: u64,
    pub exceptions: u64,
    pub not_addressed: u64,
    pub crc_errors: u64,
}

impl EngineStats {
    fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Dropped(DropReason::NotAddressed { .. }) => self.not_addressed += 1,
            CycleOutcome::Dropped(DropReason::CrcMismatch { .. }) => self.crc_errors += 1,
            CycleOutcome::Responded { response, .. } if response.is_exception() => self.exceptions += 1,
            CycleOutcome::Responded { .. } => self.served += 1,
        }
    }
}

enum Inbound {
    Dropped(DropReason),
    Rejected {
        function: FunctionCode,
        code: ExceptionCode,
    },
    Request(SlaveRequest),
}

#[derive(Debug, Default)]
struct StateTracker {
    current: EngineState,
    #[cfg(test)]
    trail: Vec<EngineState>,
}

impl StateTracker {
    fn enter(&mut self, next: EngineState) {
        trace!("{:?} -> {:?}", self.current, next);
        self.current = next;
        #[cfg(test)]
        self.trail.push(next);
    }
}

/// Modbus RTU slave: one request in, at most one response out, per cycle.
///
/// Nothing survives a cycle except the register backend contents and the
/// statistics counters.
pub struct SlaveEngine<T, S, B>
where
    T: ByteSource + ByteSink,
    S: SilenceTimer,
    B: RegisterBackend,
{
    station: StationAddress,
    transport: T,
    silence: SilenceDetector<S>,
    backend: B,
    state: StateTracker,
    stats: EngineStats,
}

impl<T, S, B> SlaveEngine<T, S, B>
where
    T: ByteSource + ByteSink,
    S: SilenceTimer,
    B: RegisterBackend,
{
    pub fn new(station: StationAddress, transport: T, silence: SilenceDetector<S>, backend: B) -> Self {
        Self {
            station,
            transport,
            silence,
            backend,
            state: StateTracker::default(),
            stats: EngineStats::default(),
        }
    }

    pub fn station(&self) -> StationAddress {
        self.station
    }

    pub fn state(&self) -> EngineState {
        self.state.current
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_parts(self) -> (T, SilenceDetector<S>, B) {
        (self.transport, self.silence, self.backend)
    }

    /// Serves cycles until the transport gives out.
    ///
    /// A closed transport or a shutdown request ends the loop normally; any
    /// other transport failure is returned.
    pub fn run(&mut self) -> Result<EngineStats, ModbusError> {
        info!("🚀 Modbus RTU slave listening as station {}", self.station);

        loop {
            match self.serve_once() {
                Ok(_) => {}
                Err(ModbusError::Shutdown) => {
                    info!("🛑 Shutdown requested, leaving the serve loop");
                    return Ok(self.stats);
                }
                Err(ModbusError::TransportClosed) => {
                    info!("Transport closed, leaving the serve loop");
                    return Ok(self.stats);
                }
                Err(e) => {
                    error!("❌ Transport failure: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Runs one full cycle: silence, receive, validate, dispatch, respond.
    pub fn serve_once(&mut self) -> Result<CycleOutcome, ModbusError> {
        let result = self.cycle();
        self.state.enter(EngineState::Idle);

        let outcome = result?;
        self.stats.record(&outcome);
        Ok(outcome)
    }

    fn cycle(&mut self) -> Result<CycleOutcome, ModbusError> {
        self.state.enter(EngineState::WaitSilence);
        let discarded = self.silence.wait(&mut self.transport)?;
        if discarded > 0 {
            debug!("Skipped {} bytes of a frame already in progress", discarded);
        }

        let response = match self.receive()? {
            Inbound::Dropped(reason) => {
                debug!("Frame dropped: {:?}", reason);
                return Ok(CycleOutcome::Dropped(reason));
            }
            Inbound::Rejected { function, code } => {
                self.state.enter(EngineState::Dispatch);
                SlaveResponse::exception(function, code)
            }
            Inbound::Request(request) => {
                self.state.enter(EngineState::Dispatch);
                self.dispatch(request)
            }
        };

        let frame = self.respond(&response)?;
        Ok(CycleOutcome::Responded { response, frame })
    }

    /// Reads the station id, the function code and, for supported functions,
    /// the full fixed field set plus CRC trailer, then validates what it read.
    fn receive(&mut self) -> Result<Inbound, ModbusError> {
        let mut reader = FrameReader::new(&mut self.transport);

        self.state.enter(EngineState::ReadStationId);
        let station = reader.read_byte()?;
        if station != self.station.get() {
            return Ok(Inbound::Dropped(DropReason::NotAddressed { station }));
        }

        self.state.enter(EngineState::ReadFunctionCode);
        let function = FunctionCode::from(reader.read_byte()?);
        if let FunctionCode::Unsupported(_) = function {
            // Answered right away, nothing after the function code is read
            self.state.enter(EngineState::Validate);
            return Ok(Inbound::Rejected {
                function,
                code: ExceptionCode::InvalidFunction,
            });
        }

        self.state.enter(EngineState::ReadFixedPayload);
        let fields = reader.read_array::<FIXED_PAYLOAD_LEN>()?;

        self.state.enter(EngineState::ReadCrc);
        let (crc_lo, crc_hi) = reader.read_trailer()?;

        self.state.enter(EngineState::Validate);
        let crc = reader.crc();
        if !crc.matches(crc_lo, crc_hi) {
            return Ok(Inbound::Dropped(DropReason::CrcMismatch {
                computed: crc.value(),
                received: u16::from_le_bytes([crc_lo, crc_hi]),
            }));
        }

        Ok(match SlaveRequest::from_fields(function, fields) {
            Ok(request) => Inbound::Request(request),
            Err(code) => Inbound::Rejected { function, code },
        })
    }

    fn dispatch(&mut self, request: SlaveRequest) -> SlaveResponse {
        match request {
            SlaveRequest::ReadHoldingRegisters { address, count } => {
                let values = (0..count)
                    .map(|offset| self.backend.read(address.wrapping_add(offset)))
                    .collect();
                debug!("Read {} registers from 0x{:02X}", count, address);
                SlaveResponse::ReadHoldingRegisters { values }
            }
            SlaveRequest::WriteSingleRegister { address, value } => {
                self.backend.write(address, value);
                debug!("Wrote 0x{:02X} to register 0x{:02X}", value, address);
                SlaveResponse::WriteSingleRegister { address, value }
            }
        }
    }

    fn respond(&mut self, response: &SlaveResponse) -> Result<Vec<u8>, ModbusError> {
        self.state.enter(EngineState::Respond);

        if let SlaveResponse::Exception { function, code } = response {
            warn!("⚠️  Exception 0x{:02X} ({}) for function 0x{:02X}", code.value(), code, function);
        }

        let mut writer = FrameWriter::new(&mut self.transport);
        writer.write_all(&response.body(self.station))?;
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::register_map::RegisterMap;
    use crate::modbus::crc::crc16_modbus;
    use crate::modbus::protocol::{append_crc, MasterRequest};
    use crate::modbus::transport::BufferTransport;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Done on the first poll; shares its armed flag with the test.
    struct FlagTimer {
        armed: Rc<Cell<bool>>,
        cycles: Rc<Cell<usize>>,
    }

    impl SilenceTimer for FlagTimer {
        fn load(&mut self, _ticks: u32) {}

        fn clear(&mut self) {}

        fn enable(&mut self) {
            self.armed.set(true);
            self.cycles.set(self.cycles.get() + 1);
        }

        fn disable(&mut self) {
            self.armed.set(false);
        }

        fn is_done(&mut self) -> bool {
            true
        }
    }

    /// Refuses to hand out frame bytes while the silence timer is armed.
    /// Stray bytes may still be drained during the wait.
    struct GuardedTransport {
        inner: BufferTransport,
        armed: Rc<Cell<bool>>,
    }

    impl ByteSource for GuardedTransport {
        fn receive(&mut self) -> Result<u8, ModbusError> {
            assert!(!self.armed.get(), "byte read while the silence timer was armed");
            self.inner.receive()
        }

        fn try_receive(&mut self) -> Result<Option<u8>, ModbusError> {
            self.inner.try_receive()
        }
    }

    impl ByteSink for GuardedTransport {
        fn send(&mut self, byte: u8) -> Result<(), ModbusError> {
            self.inner.send(byte)
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        map: RegisterMap,
        reads: Rc<RefCell<Vec<u8>>>,
        writes: usize,
    }

    impl RegisterBackend for CountingBackend {
        fn read(&mut self, address: u8) -> u8 {
            self.reads.borrow_mut().push(address);
            self.map.read(address)
        }

        fn write(&mut self, address: u8, value: u8) {
            self.writes += 1;
            self.map.write(address, value);
        }
    }

    type TestEngine = SlaveEngine<GuardedTransport, FlagTimer, CountingBackend>;

    struct Harness {
        engine: TestEngine,
        cycles: Rc<Cell<usize>>,
    }

    fn harness(station: u8, input: &[u8], presets: &[(u8, u8)]) -> Harness {
        let armed = Rc::new(Cell::new(false));
        let cycles = Rc::new(Cell::new(0));
        let timer = FlagTimer {
            armed: armed.clone(),
            cycles: cycles.clone(),
        };
        let transport = GuardedTransport {
            inner: BufferTransport::with_input(input),
            armed,
        };
        let mut backend = CountingBackend::default();
        for &(address, value) in presets {
            backend.map.write(address, value);
        }

        let silence = SilenceDetector::new(timer, 1_000_000, 9600).unwrap();
        let station = StationAddress::try_from(station).unwrap();
        Harness {
            engine: SlaveEngine::new(station, transport, silence, backend),
            cycles,
        }
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_read_holding_registers_scenario() {
        let request = framed(&[0x01, 0x03, 0x00, 0x05, 0x00, 0x02]);
        let mut h = harness(1, &request, &[(5, 0xAA), (6, 0xBB)]);

        let outcome = h.engine.serve_once().unwrap();

        let expected = framed(&[0x01, 0x03, 0x04, 0x00, 0xAA, 0x00, 0xBB]);
        assert_eq!(outcome.frame(), expected.as_slice());
        assert_eq!(h.engine.transport().inner.sent(), expected.as_slice());
        assert_eq!(*h.engine.backend().reads.borrow(), vec![5, 6]);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.stats().served, 1);
    }

    #[test]
    fn test_read_reports_byte_count_and_values_in_order() {
        for count in 0u8..=4 {
            let request = MasterRequest::ReadHoldingRegisters { station: 7, address: 0x10, count: count as u16 }.encode();
            let mut h = harness(7, &request, &[(0x10, 1), (0x11, 2), (0x12, 3), (0x13, 4)]);

            let outcome = h.engine.serve_once().unwrap();
            let frame = outcome.frame();

            assert_eq!(frame[2], count * 2);
            assert_eq!(frame.len(), 3 + 2 * count as usize + 2);
            for i in 0..count as usize {
                assert_eq!(frame[3 + 2 * i], 0x00);
                assert_eq!(frame[4 + 2 * i], (i + 1) as u8);
            }
            assert_eq!(crc16_modbus(frame), 0x0000);
        }
    }

    #[test]
    fn test_read_wraps_past_top_of_register_space() {
        let request = framed(&[0x01, 0x03, 0x00, 0xFF, 0x00, 0x02]);
        let mut h = harness(1, &request, &[(0xFF, 0x11), (0x00, 0x22)]);

        let outcome = h.engine.serve_once().unwrap();
        assert_eq!(&outcome.frame()[..7], &[0x01, 0x03, 0x04, 0x00, 0x11, 0x00, 0x22]);
        assert_eq!(*h.engine.backend().reads.borrow(), vec![0xFF, 0x00]);
    }

    #[test]
    fn test_write_single_register_echoes_request() {
        let request = MasterRequest::WriteSingleRegister { station: 0x5A, address: 0x20, value: 0x3C }.encode();
        let mut h = harness(0x5A, &request, &[]);

        let outcome = h.engine.serve_once().unwrap();

        assert_eq!(outcome.frame(), request.as_slice());
        assert_eq!(h.engine.backend_mut().read(0x20), 0x3C);
        assert_eq!(
            outcome,
            CycleOutcome::Responded {
                response: SlaveResponse::WriteSingleRegister { address: 0x20, value: 0x3C },
                frame: request.clone(),
            }
        );
    }

    #[test]
    fn test_single_bit_corruption_is_dropped_silently() {
        let request = framed(&[0x01, 0x06, 0x00, 0x20, 0x00, 0x3C]);

        // Payload fields and CRC trailer, every bit
        for index in 2..request.len() {
            for bit in 0..8 {
                let mut corrupted = request.clone();
                corrupted[index] ^= 1 << bit;

                let mut h = harness(1, &corrupted, &[]);
                let outcome = h.engine.serve_once().unwrap();

                assert!(
                    matches!(outcome, CycleOutcome::Dropped(DropReason::CrcMismatch { .. })),
                    "byte {} bit {} was not rejected",
                    index,
                    bit
                );
                assert!(h.engine.transport().inner.sent().is_empty());
                assert_eq!(h.engine.backend().writes, 0);
                assert_eq!(h.engine.transport().inner.pending(), 0);
            }
        }
    }

    #[test]
    fn test_address_high_byte_rejected_without_backend_access() {
        let request = framed(&[0x01, 0x03, 0x01, 0x05, 0x00, 0x02]);
        let mut h = harness(1, &request, &[]);

        let outcome = h.engine.serve_once().unwrap();

        assert_eq!(outcome.frame(), framed(&[0x01, 0x83, 0x02]).as_slice());
        assert!(h.engine.backend().reads.borrow().is_empty());
        assert_eq!(h.engine.stats().exceptions, 1);
    }

    #[test]
    fn test_write_range_checks() {
        let bad_address = framed(&[0x01, 0x06, 0x02, 0x20, 0x00, 0x3C]);
        let bad_data = framed(&[0x01, 0x06, 0x00, 0x20, 0x01, 0x3C]);
        let mut h = harness(1, &bad_address, &[]);
        h.engine.transport_mut().inner.feed(&bad_data);

        let first = h.engine.serve_once().unwrap();
        let second = h.engine.serve_once().unwrap();

        assert_eq!(first.frame(), framed(&[0x01, 0x86, 0x02]).as_slice());
        assert_eq!(second.frame(), framed(&[0x01, 0x86, 0x03]).as_slice());
        assert_eq!(h.engine.backend().writes, 0);
    }

    #[test]
    fn test_count_high_byte_is_invalid_data() {
        let request = framed(&[0x01, 0x03, 0x00, 0x05, 0x01, 0x00]);
        let mut h = harness(1, &request, &[]);

        let outcome = h.engine.serve_once().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Responded {
                response: SlaveResponse::exception(FunctionCode::ReadHoldingRegisters, ExceptionCode::InvalidData),
                frame: framed(&[0x01, 0x83, 0x03]),
            }
        );
    }

    #[test]
    fn test_unknown_function_answered_after_two_bytes() {
        let mut input = vec![0x01, 0x10];
        input.extend_from_slice(&[0x00, 0x01, 0x00, 0x02]);
        let mut h = harness(1, &input, &[]);

        let outcome = h.engine.serve_once().unwrap();

        assert_eq!(outcome.frame(), framed(&[0x01, 0x90, 0x01]).as_slice());
        assert_eq!(h.engine.transport().inner.pending(), 4);
    }

    #[test]
    fn test_foreign_station_is_ignored_after_one_byte() {
        let request = framed(&[0x02, 0x03, 0x00, 0x05, 0x00, 0x02]);
        let mut h = harness(1, &request, &[(5, 0xAA)]);

        let outcome = h.engine.serve_once().unwrap();

        assert_eq!(outcome, CycleOutcome::Dropped(DropReason::NotAddressed { station: 2 }));
        assert!(h.engine.transport().inner.sent().is_empty());
        assert_eq!(h.engine.transport().inner.pending(), request.len() - 1);
        assert_eq!(h.engine.stats().not_addressed, 1);
    }

    #[test]
    fn test_whole_foreign_frame_gets_no_reply() {
        // Read of register 1 for station 2; the payload carries 0x01 and 0x03
        let foreign = [0x02, 0x03, 0x00, 0x01, 0x00, 0x01, 0xD5, 0xF9];
        assert_eq!(crc16_modbus(&foreign), 0x0000);
        let mut h = harness(1, &foreign, &[(1, 0x77)]);

        let stats = h.engine.run().unwrap();

        assert!(h.engine.transport().inner.sent().is_empty());
        assert_eq!(stats.not_addressed, 1);
        assert_eq!(stats.served + stats.exceptions + stats.crc_errors, 0);
        assert!(h.engine.backend().reads.borrow().is_empty());
    }

    #[test]
    fn test_own_frame_after_foreign_traffic_is_served_once() {
        let foreign = framed(&[0x02, 0x06, 0x00, 0x01, 0x00, 0x03]);
        let own = framed(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x01]);
        let mut h = harness(1, &foreign, &[(1, 0x42)]);
        h.engine.transport_mut().inner.feed(&own);

        let stats = h.engine.run().unwrap();

        assert_eq!(h.engine.transport().inner.sent(), framed(&[0x01, 0x03, 0x02, 0x00, 0x42]).as_slice());
        assert_eq!(stats.served, 1);
        assert_eq!(stats.not_addressed, 1);
        assert_eq!(h.engine.backend().writes, 0);
    }

    #[test]
    fn test_unknown_function_tail_is_not_answered_again() {
        // Write Multiple Registers; the tail holds the station id and 0x00
        let request = framed(&[0x01, 0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0x00, 0x0A]);
        let mut h = harness(1, &request, &[]);

        let stats = h.engine.run().unwrap();

        assert_eq!(h.engine.transport().inner.sent(), framed(&[0x01, 0x90, 0x01]).as_slice());
        assert_eq!(
            stats,
            EngineStats {
                served: 0,
                exceptions: 1,
                not_addressed: 0,
                crc_errors: 0,
            }
        );
        assert_eq!(h.engine.backend().writes, 0);
    }

    #[test]
    fn test_state_trail_for_each_cycle_shape() {
        use EngineState::*;

        let mut h = harness(1, &framed(&[0x01, 0x03, 0x01, 0x05, 0x00, 0x02]), &[]);
        h.engine.serve_once().unwrap();
        assert_eq!(
            h.engine.state.trail,
            vec![WaitSilence, ReadStationId, ReadFunctionCode, ReadFixedPayload, ReadCrc, Validate, Dispatch, Respond, Idle]
        );

        let mut h = harness(1, &framed(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x02]), &[]);
        h.engine.serve_once().unwrap();
        assert_eq!(
            h.engine.state.trail,
            vec![WaitSilence, ReadStationId, ReadFunctionCode, ReadFixedPayload, ReadCrc, Validate, Dispatch, Respond, Idle]
        );

        let mut h = harness(1, &[0x01, 0x2B], &[]);
        h.engine.serve_once().unwrap();
        assert_eq!(
            h.engine.state.trail,
            vec![WaitSilence, ReadStationId, ReadFunctionCode, Validate, Dispatch, Respond, Idle]
        );

        let mut h = harness(1, &[0x09], &[]);
        h.engine.serve_once().unwrap();
        assert_eq!(h.engine.state.trail, vec![WaitSilence, ReadStationId, Idle]);

        let mut corrupted = framed(&[0x01, 0x03, 0x00, 0x05, 0x00, 0x02]);
        corrupted[7] ^= 0x01;
        let mut h = harness(1, &corrupted, &[]);
        h.engine.serve_once().unwrap();
        assert_eq!(
            h.engine.state.trail,
            vec![WaitSilence, ReadStationId, ReadFunctionCode, ReadFixedPayload, ReadCrc, Validate, Idle]
        );
    }

    #[test]
    fn test_byte_count_wraps_for_large_counts() {
        let request = framed(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x80]);
        let mut h = harness(1, &request, &[]);

        let outcome = h.engine.serve_once().unwrap();
        let frame = outcome.frame();
        assert_eq!(frame[2], 0x00);
        assert_eq!(frame.len(), 3 + 256 + 2);
    }

    #[test]
    fn test_run_serves_until_transport_closes() {
        let mut h = harness(1, &framed(&[0x01, 0x06, 0x00, 0x20, 0x00, 0x3C]), &[]);
        h.engine.transport_mut().inner.feed(&framed(&[0x01, 0x03, 0x00, 0x20, 0x00, 0x01]));
        h.engine.transport_mut().inner.feed(&[0x01, 0x2B]);

        let stats = h.engine.run().unwrap();

        assert_eq!(
            stats,
            EngineStats {
                served: 2,
                exceptions: 1,
                not_addressed: 0,
                crc_errors: 0,
            }
        );
        // One silence wait per started cycle, including the one that hit the end of input
        assert_eq!(h.cycles.get(), 4);
        assert_eq!(h.engine.state(), EngineState::Idle);

        let mut expected = framed(&[0x01, 0x06, 0x00, 0x20, 0x00, 0x3C]);
        expected.extend_from_slice(&framed(&[0x01, 0x03, 0x02, 0x00, 0x3C]));
        expected.extend_from_slice(&framed(&[0x01, 0xAB, 0x01]));
        assert_eq!(h.engine.transport().inner.sent(), expected.as_slice());
    }

    #[test]
    fn test_transport_closed_mid_frame_is_an_error() {
        let mut h = harness(1, &[0x01, 0x03, 0x00], &[]);

        assert!(matches!(h.engine.serve_once(), Err(ModbusError::TransportClosed)));
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.engine.transport().inner.sent().is_empty());
    }
}
