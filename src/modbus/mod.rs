pub mod crc;
pub mod frame;
pub mod master;
pub mod protocol;
pub mod silence;
pub mod slave;
pub mod transport;

pub use crc::{crc16_modbus, crc16_step, Crc16};
pub use master::ModbusMaster;
pub use protocol::{ExceptionCode, FunctionCode, MasterRequest, SlaveRequest, SlaveResponse, StationAddress};
pub use silence::{silence_ticks, HostTimer, SilenceDetector, SilenceTimer, SystemClock};
pub use slave::{CycleOutcome, DropReason, EngineState, EngineStats, SlaveEngine};
pub use transport::{BufferTransport, ByteSink, ByteSource, SerialTransport};
